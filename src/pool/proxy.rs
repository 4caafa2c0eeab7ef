//! Proxy identity and per-proxy statistics.

use crate::config::DEFAULT_HANDSHAKE_AVG;
use crate::error::ProxyParseError;
use std::fmt;
use std::net::SocketAddrV4;
use std::str::FromStr;
use std::time::Duration;

/// CONNECT dialect spoken by an upstream proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyKind {
    /// Plain-text HTTP CONNECT.
    Http,
    /// HTTP CONNECT over a TLS session to the proxy.
    Https,
    /// SOCKS4 CONNECT.
    Socks4,
    /// SOCKS5 CONNECT, no authentication.
    Socks5,
}

impl ProxyKind {
    /// URL scheme used for this kind in the proxy list file.
    pub fn scheme(self) -> &'static str {
        match self {
            ProxyKind::Http => "http",
            ProxyKind::Https => "https",
            ProxyKind::Socks4 => "socks4",
            ProxyKind::Socks5 => "socks5",
        }
    }

    /// Parse a list-file scheme into a kind.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "http" => Some(ProxyKind::Http),
            "https" => Some(ProxyKind::Https),
            "socks4" => Some(ProxyKind::Socks4),
            "socks5" => Some(ProxyKind::Socks5),
            _ => None,
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// Immutable identity of an upstream proxy.
///
/// Hash and equality cover the full identity, so the pool can key its maps
/// on the proxy itself. `Display` renders the proxy back into its list-file
/// URL form, which makes parse/render a round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Proxy {
    /// IPv4 address and port of the proxy.
    pub addr: SocketAddrV4,
    /// CONNECT dialect the proxy speaks.
    pub kind: ProxyKind,
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.kind.scheme(), self.addr)
    }
}

impl FromStr for Proxy {
    type Err = ProxyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, body) = s.split_once("://").ok_or(ProxyParseError::UnknownScheme)?;
        let kind = ProxyKind::from_scheme(scheme).ok_or(ProxyParseError::UnknownScheme)?;
        let addr: SocketAddrV4 = body
            .parse()
            .map_err(|_| ProxyParseError::InvalidAddress(body.to_string()))?;
        if addr.port() == 0 {
            return Err(ProxyParseError::InvalidAddress(body.to_string()));
        }
        Ok(Proxy { addr, kind })
    }
}

/// Mutable per-proxy bookkeeping, owned and mutated only by the pool.
#[derive(Debug, Clone)]
pub struct ProxyStats {
    /// Exponential-moving estimate of dial-plus-handshake latency. The
    /// pool's ranking key.
    pub handshake_avg: Duration,
    /// Consecutive critical failures.
    pub errors: u8,
    /// Last critical error, rendered.
    pub last_err: String,
}

impl ProxyStats {
    /// Stats for a proxy that has never been measured.
    pub fn seeded() -> Self {
        ProxyStats {
            handshake_avg: DEFAULT_HANDSHAKE_AVG,
            errors: 0,
            last_err: String::new(),
        }
    }
}

impl Default for ProxyStats {
    fn default() -> Self {
        Self::seeded()
    }
}
