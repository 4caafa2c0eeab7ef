//! # Sockspool - Latency-Ranked SOCKS5 Proxy Gateway
//!
//! Sockspool is a local SOCKS5 gateway that relays client traffic through a
//! pool of upstream proxies of mixed kinds (HTTP CONNECT, HTTPS CONNECT,
//! SOCKS4, SOCKS5). Proxies are ranked by their observed dial-plus-handshake
//! latency; proxies that keep failing are quarantined and later rotated back
//! in. A fleet of background workers continuously probes the pool against a
//! reference endpoint so the ranking tracks reality.
//!
//! ## Features
//!
//! - **Best-First Dispatch**: every client request gets the currently
//!   fastest proxy
//! - **Four Upstream Dialects**: HTTP, HTTPS, SOCKS4 and SOCKS5 CONNECT
//!   handshakes behind one connector
//! - **Self-Healing Pool**: repeated critical failures quarantine a proxy;
//!   an exhausted pool rotates the quarantine back in
//! - **Background Health Checks**: a worker fleet measures handshake latency
//!   against a reference endpoint
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sockspool::checker::Checker;
//! use sockspool::connector::UpstreamConnector;
//! use sockspool::pool::{channel, parser, ProxyPool};
//! use sockspool::server;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = ProxyPool::new();
//!     parser::load_proxy_file(&pool, "proxies.txt".as_ref())?;
//!
//!     let connector = UpstreamConnector::new();
//!     let checker = Checker::resolve(connector.clone()).await?;
//!
//!     let (traffic_tx, traffic_rx) = channel::request_channel();
//!     let (check_tx, check_rx) = channel::request_channel();
//!     tokio::spawn(pool.clone().serve_traffic(traffic_rx));
//!     tokio::spawn(pool.clone().serve_checker(check_rx));
//!     checker.spawn(10, check_tx);
//!
//!     server::run("127.0.0.1:1080", traffic_tx, connector).await
//! }
//! ```
//!
//! ## Architecture
//!
//! The front end and the checker workers talk to the pool over request
//! slots: a caller opens a slot, the pool answers with a proxy lease, the
//! caller attempts the upstream CONNECT and reports the outcome (an error or
//! a measured duration) back on the same slot.
//!
//! ```text
//! SOCKS5 Client -> Sockspool -> Upstream Proxy -> Target
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod checker;
pub mod config;
pub mod connector;
pub mod error;
pub mod pool;
pub mod server;

// Re-export commonly used items
pub use connector::UpstreamConnector;
pub use error::UpstreamError;
pub use pool::ProxyPool;

/// Version of the Sockspool library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
