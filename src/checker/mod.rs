//! Background proxy health checking.
//!
//! A fleet of workers pulls proxies from the pool's checker serve loop and
//! probes each one end to end: CONNECT through the proxy to the reference
//! host, TLS inside the tunnel, one request, one `204 No Content` expected
//! back. The CONNECT measurement feeds the pool's ranking; everything past
//! the CONNECT only decides pass or fail.

use crate::config::{
    CHECK_HOST, CHECK_PATH, CHECK_PAUSE, CHECK_PORT, CHECK_READ_BUF, CHECK_SKIP_BACKOFF,
    CHECK_TIMEOUT, USER_AGENT, WORKER_STAGGER,
};
use crate::connector::{Endpoint, Tunnel, UpstreamConnector};
use crate::error::UpstreamError;
use crate::pool::channel::{self, AttemptOutcome, ProxyLease, RequestSender};
use crate::pool::proxy::Proxy;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{sleep, timeout};
use tokio_rustls::rustls::pki_types::ServerName;
use tracing::{debug, info};

/// Reply prefix of a healthy probe.
const NO_CONTENT_PREFIX: &[u8] = b"HTTP/1.1 204";

/// Health-check fleet configuration: the connector and the once-resolved
/// reference endpoint.
pub struct Checker {
    connector: UpstreamConnector,
    target: Endpoint,
}

impl Checker {
    /// Build a checker against an already-resolved reference endpoint.
    pub fn new(connector: UpstreamConnector, target: Endpoint) -> Self {
        Checker { connector, target }
    }

    /// Resolve the reference host (once, for the process lifetime) and
    /// build the checker. Failure here is fatal to startup.
    pub async fn resolve(connector: UpstreamConnector) -> Result<Self> {
        let target = resolve_check_host().await?;
        info!("health checks target {CHECK_HOST} at {target}");
        Ok(Checker::new(connector, target))
    }

    /// The reference endpoint probes are sent to.
    pub fn target(&self) -> Endpoint {
        self.target
    }

    /// Launch `workers` checking tasks feeding off `requests`, staggering
    /// their starts so the fleet does not probe in lockstep.
    pub fn spawn(self, workers: usize, requests: RequestSender) {
        let checker = Arc::new(self);
        tokio::spawn(async move {
            for id in 0..workers {
                let checker = checker.clone();
                let requests = requests.clone();
                tokio::spawn(async move {
                    checker.run_worker(requests).await;
                    debug!("checker worker {id} stopped");
                });
                sleep(WORKER_STAGGER).await;
            }
        });
    }

    /// One worker: slot, lease, probe, outcome, pause. Exits when the pool
    /// side of the request channel is gone.
    async fn run_worker(&self, requests: RequestSender) {
        loop {
            match channel::acquire(&requests).await {
                None => return,
                Some(ProxyLease::Skip) => sleep(CHECK_SKIP_BACKOFF).await,
                Some(ProxyLease::Granted { proxy, outcome }) => {
                    let result = self.check(&proxy).await;
                    if let Err(err) = &result {
                        debug!("check of {proxy} failed: {err}");
                    }
                    let _ = outcome.send(result);
                    sleep(CHECK_PAUSE).await;
                }
            }
        }
    }

    /// Probe one proxy against the reference endpoint.
    ///
    /// Returns the CONNECT-stage measurement on success. Every failure is
    /// critical: a proxy that cannot reach the reference host is broken.
    async fn check(&self, proxy: &Proxy) -> AttemptOutcome {
        let (tunnel, elapsed) = self
            .connector
            .connect(proxy, &self.target)
            .await
            .map_err(|err| UpstreamError::check(err.to_string()))?;

        match timeout(CHECK_TIMEOUT, self.probe(tunnel)).await {
            Ok(Ok(())) => Ok(elapsed),
            Ok(Err(detail)) => Err(UpstreamError::check(detail)),
            Err(_) => Err(UpstreamError::check("probe timed out")),
        }
    }

    /// The probe itself: TLS with the reference host's name, one request,
    /// one read, expect `204 No Content`.
    async fn probe(&self, tunnel: Tunnel) -> std::result::Result<(), String> {
        let name = ServerName::try_from(CHECK_HOST)
            .map_err(|_| "reference host is not a valid server name".to_string())?;
        let mut session = self
            .connector
            .tls()
            .connect(name, tunnel)
            .await
            .map_err(|err| format!("handshaking with remote: {err}"))?;

        let request = format!(
            "GET {CHECK_PATH} HTTP/1.1\r\nHost: {CHECK_HOST}\r\nUser-Agent: {USER_AGENT}\r\nAccept: */*\r\n\r\n"
        );
        session
            .write_all(request.as_bytes())
            .await
            .map_err(|err| format!("sending request to remote: {err}"))?;

        let mut buf = vec![0u8; CHECK_READ_BUF];
        let n = session
            .read(&mut buf)
            .await
            .map_err(|err| format!("reading answer from remote: {err}"))?;
        if n < NO_CONTENT_PREFIX.len() || !buf.starts_with(NO_CONTENT_PREFIX) {
            return Err("unexpected answer from reference endpoint".to_string());
        }
        Ok(())
    }
}

/// Resolve the reference host to its first IPv4 address.
pub async fn resolve_check_host() -> Result<Endpoint> {
    let addrs = tokio::net::lookup_host((CHECK_HOST, CHECK_PORT))
        .await
        .with_context(|| format!("resolving {CHECK_HOST}"))?;
    for addr in addrs {
        if let SocketAddr::V4(v4) = addr {
            return Ok(Endpoint {
                ip: *v4.ip(),
                port: CHECK_PORT,
            });
        }
    }
    anyhow::bail!("{CHECK_HOST} has no IPv4 address")
}
