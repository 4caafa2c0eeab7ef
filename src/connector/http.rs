//! HTTP and HTTPS CONNECT handshakes.

use super::Endpoint;
use crate::config::{PROXY_READ_BUF, USER_AGENT};
use crate::error::UpstreamError;
use std::io;
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

/// Reply prefix of an accepting proxy.
const OK_PREFIX: &[u8] = b"HTTP/1.1 200";

/// Perform the HTTP CONNECT ritual on an open stream.
///
/// One request, one read of the reply. Anything that does not open with
/// `HTTP/1.1 200` is a denial; I/O failures and an immediate EOF are
/// critical.
pub(crate) async fn http_handshake<S>(mut stream: S, target: &Endpoint) -> Result<S, UpstreamError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nUser-Agent: {USER_AGENT}\r\nProxy-Connection: Keep-Alive\r\n\r\n"
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| UpstreamError::io("http send", e))?;

    let mut buf = vec![0u8; PROXY_READ_BUF];
    let n = stream
        .read(&mut buf)
        .await
        .map_err(|e| UpstreamError::io("http read", e))?;
    if n == 0 {
        return Err(UpstreamError::io("http read", closed()));
    }
    if n < OK_PREFIX.len() || !buf.starts_with(OK_PREFIX) {
        return Err(UpstreamError::Denied {
            stage: "http read",
            reason: "answer is not 200 OK",
        });
    }
    Ok(stream)
}

/// Perform the HTTPS CONNECT ritual: TLS to the proxy first, then the HTTP
/// ritual inside the session.
///
/// Proxies are addressed by IP, so the server name is the proxy address and
/// no SNI hostname is involved.
pub(crate) async fn https_handshake<S>(
    tls: &TlsConnector,
    stream: S,
    proxy_ip: IpAddr,
    target: &Endpoint,
) -> Result<TlsStream<S>, UpstreamError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let name = ServerName::from(proxy_ip);
    let session = tls
        .connect(name, stream)
        .await
        .map_err(UpstreamError::Tls)?;
    http_handshake(session, target).await
}

pub(crate) fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed")
}
