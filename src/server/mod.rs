//! SOCKS5 front end.
//!
//! Accepts client connections, walks each through the no-auth SOCKS5
//! handshake, resolves the requested target to IPv4, pulls the best proxy
//! from the pool (with retries) and relays bytes until both directions
//! finish.

mod consts;
pub mod reply;

pub use reply::ReplyCode;

use crate::config::{MAX_RETRIES, RETRY_COOLDOWN};
use crate::connector::{Endpoint, SocketOpts, Tunnel, UpstreamConnector};
use crate::pool::channel::{self, ProxyLease, RequestSender};
use anyhow::{bail, Context, Result};
use consts::*;
use reply::send_reply;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Bind the listen address and serve SOCKS5 clients forever.
pub async fn run(
    listen: &str,
    requests: RequestSender,
    connector: UpstreamConnector,
) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!("listening on {listen}");
    serve(listener, requests, connector).await
}

/// Serve SOCKS5 clients off an already-bound listener.
pub async fn serve(
    listener: TcpListener,
    requests: RequestSender,
    connector: UpstreamConnector,
) -> Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("error while accepting connection: {err}");
                continue;
            }
        };
        SocketOpts::for_relay().apply(&stream).ok();

        let requests = requests.clone();
        let connector = connector.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(stream, peer, requests, connector).await {
                debug!("connection from {peer} ended: {err:#}");
            }
        });
    }
}

/// What request parsing decided.
enum Request {
    /// A CONNECT to a resolved IPv4 target. `display_name` keeps the name the
    /// client asked for, for logging.
    Connect { target: Endpoint, display_name: String },
    /// The request is answered with this status and the connection closed.
    Reject(ReplyCode),
}

/// Drive one client connection through the SOCKS5 state machine.
pub async fn handle_conn<S>(
    mut client: S,
    peer: SocketAddr,
    requests: RequestSender,
    connector: UpstreamConnector,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    greet(&mut client).await?;

    let (target, display_name) = match read_request(&mut client).await? {
        Request::Connect { target, display_name } => (target, display_name),
        Request::Reject(code) => {
            send_reply(&mut client, code).await?;
            return Ok(());
        }
    };

    let Some(upstream) = acquire_upstream(&requests, &connector, &target, &display_name).await else {
        error!("unable to get a proxy for {}, dropping request", display_name);
        send_reply(&mut client, ReplyCode::GeneralFailure).await?;
        return Ok(());
    };

    send_reply(&mut client, ReplyCode::Granted)
        .await
        .with_context(|| "client left before the final reply")?;
    info!("accepted request from {peer} ({})", display_name);

    relay(client, upstream).await;
    Ok(())
}

/// Method negotiation: version 5 in, no-auth out. A greeting that is not
/// SOCKS5 terminates the connection without a reply.
async fn greet<S>(client: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    client.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        bail!("not a SOCKS5 greeting");
    }
    let mut methods = vec![0u8; head[1] as usize];
    client.read_exact(&mut methods).await?;

    client
        .write_all(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NONE])
        .await?;
    Ok(())
}

/// Read and validate the CONNECT request, resolving hostnames to IPv4.
async fn read_request<S>(client: &mut S) -> Result<Request>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    client.read_exact(&mut header).await?;

    if header[0] != SOCKS5_VERSION || header[1] != SOCKS5_CMD_CONNECT || header[2] != SOCKS5_RESERVED
    {
        return Ok(Request::Reject(ReplyCode::ProtocolError));
    }

    match header[3] {
        SOCKS5_ADDR_TYPE_IPV4 => {
            let mut octets = [0u8; 4];
            client.read_exact(&mut octets).await?;
            let mut port = [0u8; 2];
            client.read_exact(&mut port).await?;

            let target = Endpoint {
                ip: Ipv4Addr::from(octets),
                port: u16::from_be_bytes(port),
            };
            Ok(Request::Connect {
                display_name: target.to_string(),
                target,
            })
        }
        SOCKS5_ADDR_TYPE_DOMAIN => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            let domain_len = len[0] as usize;
            if domain_len == 0 || domain_len > MAX_DOMAIN_LEN {
                return Ok(Request::Reject(ReplyCode::ProtocolError));
            }
            let mut name = vec![0u8; domain_len];
            client.read_exact(&mut name).await?;
            let mut port = [0u8; 2];
            client.read_exact(&mut port).await?;
            let port = u16::from_be_bytes(port);

            let host = String::from_utf8_lossy(&name).into_owned();
            let display_name = format!("{host}:{port}");
            match resolve_ipv4(&host, port).await {
                Some(ip) => Ok(Request::Connect {
                    target: Endpoint { ip, port },
                    display_name,
                }),
                None => {
                    warn!("unable to resolve requested host {host}");
                    Ok(Request::Reject(ReplyCode::HostUnreachable))
                }
            }
        }
        SOCKS5_ADDR_TYPE_IPV6 => Ok(Request::Reject(ReplyCode::AddressTypeNotSupported)),
        // anything else the wire could carry
        _ => Ok(Request::Reject(ReplyCode::AddressTypeNotSupported)),
    }
}

/// Resolve a hostname to its first IPv4 address via the OS.
async fn resolve_ipv4(host: &str, port: u16) -> Option<Ipv4Addr> {
    let addrs = tokio::net::lookup_host((host, port)).await.ok()?;
    for addr in addrs {
        if let SocketAddr::V4(v4) = addr {
            return Some(*v4.ip());
        }
    }
    None
}

/// Pull proxies from the pool until one connects, pacing the retries.
async fn acquire_upstream(
    requests: &RequestSender,
    connector: &UpstreamConnector,
    target: &Endpoint,
    display_name: &str,
) -> Option<Tunnel> {
    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            sleep(RETRY_COOLDOWN).await;
        }
        match try_upstream(requests, connector, target).await {
            Some(tunnel) => return Some(tunnel),
            None => error!(
                "unable to get a proxy for {} (attempt {} of {})",
                display_name,
                attempt + 1,
                MAX_RETRIES + 1
            ),
        }
    }
    None
}

/// One acquisition: take a lease, attempt the CONNECT, report the outcome.
async fn try_upstream(
    requests: &RequestSender,
    connector: &UpstreamConnector,
    target: &Endpoint,
) -> Option<Tunnel> {
    let lease = channel::acquire(requests).await?;
    let ProxyLease::Granted { proxy, outcome } = lease else {
        return None;
    };
    match connector.connect(&proxy, target).await {
        Ok((tunnel, elapsed)) => {
            let _ = outcome.send(Ok(elapsed));
            Some(tunnel)
        }
        Err(err) => {
            warn!("proxy {proxy} failed for {target}: {err}");
            let _ = outcome.send(Err(err));
            None
        }
    }
}

/// Pipe bytes both ways until both directions finish. EOF on one side
/// propagates as a shutdown to the other.
async fn relay<S>(mut client: S, mut upstream: Tunnel)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((to_upstream, to_client)) => {
            debug!("relay finished: {to_upstream} bytes up, {to_client} bytes down");
        }
        Err(err) => debug!("relay ended: {err}"),
    }
}
