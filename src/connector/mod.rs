//! Upstream CONNECT dialing.
//!
//! One entry point dials a proxy, runs the kind-specific CONNECT ritual and
//! hands back a ready tunnel plus the measured dial-plus-handshake time.
//! The four rituals are plain async functions over any stream, so they can
//! be exercised against in-memory mocks.

mod http;
mod socks;

use crate::config::{UPSTREAM_DIAL_TIMEOUT, UPSTREAM_HANDSHAKE_TIMEOUT};
use crate::error::UpstreamError;
use crate::pool::proxy::{Proxy, ProxyKind};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Pre-resolved IPv4 target of a CONNECT.
///
/// Hostname resolution happens before this type exists: the front end
/// resolves client-supplied names, the checker resolves the reference host
/// once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    /// Target IPv4 address.
    pub ip: Ipv4Addr,
    /// Target port.
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Anything usable as a relay tunnel.
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

impl fmt::Debug for dyn ProxyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn ProxyStream")
    }
}

/// Boxed tunnel returned by [`UpstreamConnector::connect`].
pub type Tunnel = Box<dyn ProxyStream>;

/// Socket options applied to relay connections.
#[derive(Debug, Clone)]
pub struct SocketOpts {
    /// Enable TCP_NODELAY
    pub nodelay: bool,
    /// TCP keepalive timeout
    pub keepalive_secs: Option<u64>,
    /// TCP keepalive interval
    pub keepalive_interval: Option<u64>,
}

impl Default for SocketOpts {
    fn default() -> Self {
        SocketOpts {
            nodelay: true,
            keepalive_secs: Some(20),
            keepalive_interval: Some(8),
        }
    }
}

impl SocketOpts {
    /// Options for relay sockets on both sides of the gateway.
    pub fn for_relay() -> Self {
        Self::default()
    }

    /// Apply the options to a TCP stream.
    pub fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;

        if let (Some(time), Some(interval)) = (self.keepalive_secs, self.keepalive_interval) {
            let socket = socket2::SockRef::from(stream);
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(time))
                .with_interval(Duration::from_secs(interval));
            socket.set_tcp_keepalive(&keepalive)?;
        }

        Ok(())
    }
}

/// Dials upstream proxies and completes their CONNECT handshakes.
///
/// Cheap to clone; the contained TLS configuration is shared.
#[derive(Clone)]
pub struct UpstreamConnector {
    tls: TlsConnector,
}

impl UpstreamConnector {
    /// Build a connector validating TLS against the platform root store.
    pub fn new() -> Self {
        let mut roots = RootCertStore::empty();
        for cert in rustls_native_certs::load_native_certs().certs {
            roots.add(cert).ok();
        }
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        UpstreamConnector {
            tls: TlsConnector::from(Arc::new(config)),
        }
    }

    /// TLS connector, shared with the health checker's probe stage.
    pub fn tls(&self) -> &TlsConnector {
        &self.tls
    }

    /// Dial `proxy` and tunnel through it to `target`.
    ///
    /// The TCP dial and the handshake each run under a one second deadline.
    /// Success yields the open tunnel and the wall-clock dial-plus-handshake
    /// duration; the returned tunnel carries no deadline at all.
    pub async fn connect(
        &self,
        proxy: &Proxy,
        target: &Endpoint,
    ) -> Result<(Tunnel, Duration), UpstreamError> {
        let started = Instant::now();

        let stream = match timeout(UPSTREAM_DIAL_TIMEOUT, TcpStream::connect(proxy.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(UpstreamError::Connect(err)),
            Err(_) => return Err(UpstreamError::ConnectTimeout),
        };
        SocketOpts::for_relay().apply(&stream).ok();

        let tunnel: Tunnel = match proxy.kind {
            ProxyKind::Http => Box::new(self.handshake(http::http_handshake(stream, target), "http").await?),
            ProxyKind::Https => {
                let ip = IpAddr::V4(*proxy.addr.ip());
                Box::new(
                    self.handshake(http::https_handshake(&self.tls, stream, ip, target), "https")
                        .await?,
                )
            }
            ProxyKind::Socks4 => {
                Box::new(self.handshake(socks::socks4_handshake(stream, target), "s4").await?)
            }
            ProxyKind::Socks5 => {
                Box::new(self.handshake(socks::socks5_handshake(stream, target), "s5").await?)
            }
        };

        let elapsed = started.elapsed();
        debug!("tunnel to {target} via {proxy} up in {elapsed:?}");
        Ok((tunnel, elapsed))
    }

    /// Run one handshake ritual under the handshake deadline.
    async fn handshake<F, S>(&self, ritual: F, stage: &'static str) -> Result<S, UpstreamError>
    where
        F: std::future::Future<Output = Result<S, UpstreamError>>,
    {
        match timeout(UPSTREAM_HANDSHAKE_TIMEOUT, ritual).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::HandshakeTimeout { stage }),
        }
    }
}

impl Default for UpstreamConnector {
    fn default() -> Self {
        Self::new()
    }
}
