//! SOCKS5 reply framing.
//!
//! Every reply this gateway sends is the fixed ten-byte frame: version,
//! status, reserved, ATYP=IPv4, zeroed bind address and port.

use super::consts::*;
use anyhow::Result;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Length of the fixed reply frame.
pub const REPLY_LEN: usize = 10;

/// Reply status codes (RFC 1928 section 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    /// Request granted
    Granted = 0x00,
    /// General SOCKS server failure
    GeneralFailure = 0x01,
    /// Connection not allowed by ruleset
    NotAllowed = 0x02,
    /// Network unreachable
    NetworkUnreachable = 0x03,
    /// Host unreachable
    HostUnreachable = 0x04,
    /// Connection refused
    ConnectionRefused = 0x05,
    /// TTL expired
    TtlExpired = 0x06,
    /// Protocol error
    ProtocolError = 0x07,
    /// Address type not supported
    AddressTypeNotSupported = 0x08,
}

impl From<ReplyCode> for u8 {
    fn from(code: ReplyCode) -> Self {
        code as u8
    }
}

impl TryFrom<u8> for ReplyCode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ReplyCode::Granted),
            0x01 => Ok(ReplyCode::GeneralFailure),
            0x02 => Ok(ReplyCode::NotAllowed),
            0x03 => Ok(ReplyCode::NetworkUnreachable),
            0x04 => Ok(ReplyCode::HostUnreachable),
            0x05 => Ok(ReplyCode::ConnectionRefused),
            0x06 => Ok(ReplyCode::TtlExpired),
            0x07 => Ok(ReplyCode::ProtocolError),
            0x08 => Ok(ReplyCode::AddressTypeNotSupported),
            other => Err(other),
        }
    }
}

/// Build the fixed reply frame for a status.
pub fn reply_frame(code: ReplyCode) -> [u8; REPLY_LEN] {
    let mut frame = [0u8; REPLY_LEN];
    frame[0] = SOCKS5_VERSION;
    frame[1] = code.into();
    frame[2] = SOCKS5_RESERVED;
    frame[3] = SOCKS5_ADDR_TYPE_IPV4;
    frame
}

/// Send the reply frame for a status.
pub async fn send_reply<S>(stream: &mut S, code: ReplyCode) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&reply_frame(code)).await?;
    stream.flush().await?;
    Ok(())
}
