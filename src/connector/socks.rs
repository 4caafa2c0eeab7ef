//! SOCKS4 and SOCKS5 CONNECT handshakes.

use super::http::closed;
use super::Endpoint;
use crate::config::PROXY_READ_BUF;
use crate::error::UpstreamError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Perform the SOCKS4 CONNECT ritual.
///
/// Nine request bytes, one read. `0x00 0x5A` means granted; any other
/// status is a denial.
pub(crate) async fn socks4_handshake<S>(
    mut stream: S,
    target: &Endpoint,
) -> Result<S, UpstreamError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = Vec::with_capacity(9);
    request.extend_from_slice(&[0x04, 0x01]);
    request.extend_from_slice(&target.port.to_be_bytes());
    request.extend_from_slice(&target.ip.octets());
    request.push(0x00);

    stream
        .write_all(&request)
        .await
        .map_err(|e| UpstreamError::io("s4 send", e))?;

    let mut buf = vec![0u8; PROXY_READ_BUF];
    let n = stream
        .read(&mut buf)
        .await
        .map_err(|e| UpstreamError::io("s4 read", e))?;
    if n == 0 {
        return Err(UpstreamError::io("s4 read", closed()));
    }
    if n < 2 || buf[..2] != [0x00, 0x5a] {
        return Err(UpstreamError::Denied {
            stage: "s4 read",
            reason: "request not granted",
        });
    }
    Ok(stream)
}

/// Perform the two-stage SOCKS5 CONNECT ritual, offering only the no-auth
/// method.
///
/// A proxy that rejects no-auth is broken for our purposes, so the stage-1
/// rejection is critical; a stage-2 refusal is an ordinary denial.
pub(crate) async fn socks5_handshake<S>(
    mut stream: S,
    target: &Endpoint,
) -> Result<S, UpstreamError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // stage 1: method selection
    stream
        .write_all(&[0x05, 0x01, 0x00])
        .await
        .map_err(|e| UpstreamError::io("s5 method send", e))?;

    let mut buf = vec![0u8; PROXY_READ_BUF];
    let n = stream
        .read(&mut buf)
        .await
        .map_err(|e| UpstreamError::io("s5 method read", e))?;
    if n == 0 {
        return Err(UpstreamError::io("s5 method read", closed()));
    }
    if n < 2 || buf[..2] != [0x05, 0x00] {
        return Err(UpstreamError::AuthRejected);
    }

    // stage 2: CONNECT, IPv4
    let mut request = Vec::with_capacity(10);
    request.extend_from_slice(&[0x05, 0x01, 0x00, 0x01]);
    request.extend_from_slice(&target.ip.octets());
    request.extend_from_slice(&target.port.to_be_bytes());

    stream
        .write_all(&request)
        .await
        .map_err(|e| UpstreamError::io("s5 connect send", e))?;

    let n = stream
        .read(&mut buf)
        .await
        .map_err(|e| UpstreamError::io("s5 connect read", e))?;
    if n == 0 {
        return Err(UpstreamError::io("s5 connect read", closed()));
    }
    if n < 3 || buf[..3] != [0x05, 0x00, 0x00] {
        return Err(UpstreamError::Denied {
            stage: "s5 connect read",
            reason: "request not granted",
        });
    }
    Ok(stream)
}
