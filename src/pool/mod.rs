//! Latency-ranked upstream proxy pool.
//!
//! The pool is the shared brain of the gateway: it knows every proxy, how
//! fast each one has been lately, and which ones are in the penalty box.
//! Traffic and health checking both pull proxies from it through request
//! slots ([`channel`]).

pub mod channel;
pub mod manager;
pub mod parser;
pub mod proxy;

pub use manager::ProxyPool;
pub use proxy::{Proxy, ProxyKind, ProxyStats};
