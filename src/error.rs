//! Error types for Sockspool
//!
//! This module defines the upstream error taxonomy and the proxy list
//! parsing errors used throughout the application.

use std::io;
use thiserror::Error;

/// Errors produced while dialing an upstream proxy and completing its
/// CONNECT handshake.
///
/// The pool cares about exactly one property of these: whether the error is
/// evidence that the proxy itself is broken. Critical errors count toward
/// quarantine; a denied CONNECT means the proxy is alive but refused this
/// particular target, and is not counted.
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// TCP dial to the proxy failed.
    #[error("while connecting: {0}")]
    Connect(#[source] io::Error),

    /// TCP dial did not finish within the dial deadline.
    #[error("while connecting: dial timed out")]
    ConnectTimeout,

    /// The handshake deadline expired mid-ritual.
    #[error("{stage}: handshake timed out")]
    HandshakeTimeout {
        /// Handshake stage that was in flight when the deadline hit.
        stage: &'static str,
    },

    /// I/O failed during a handshake stage.
    #[error("{stage}: {source}")]
    Io {
        /// Handshake stage that failed.
        stage: &'static str,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// TLS handshake with an HTTPS proxy failed.
    #[error("proxy tls handshake: {0}")]
    Tls(#[source] io::Error),

    /// A SOCKS5 proxy refused the no-auth method.
    #[error("s5 method select: no-auth rejected")]
    AuthRejected,

    /// The proxy answered the handshake, but refused the CONNECT.
    #[error("{stage}: {reason}")]
    Denied {
        /// Handshake stage that produced the refusal.
        stage: &'static str,
        /// What the refusal looked like.
        reason: &'static str,
    },

    /// A health-check probe failed past the CONNECT stage.
    #[error("checking phase: {detail}")]
    Check {
        /// Rendered probe failure.
        detail: String,
    },
}

impl UpstreamError {
    /// Whether this error counts against the proxy's quarantine budget.
    pub fn is_critical(&self) -> bool {
        !matches!(self, UpstreamError::Denied { .. })
    }

    /// Build an I/O error for a named handshake stage.
    pub(crate) fn io(stage: &'static str, source: io::Error) -> Self {
        UpstreamError::Io { stage, source }
    }

    /// Build an always-critical check-phase error.
    pub(crate) fn check(detail: impl Into<String>) -> Self {
        UpstreamError::Check {
            detail: detail.into(),
        }
    }
}

/// Errors from parsing one proxy list line.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProxyParseError {
    /// The line does not start with a recognized scheme.
    #[error("unknown scheme")]
    UnknownScheme,

    /// The part after the scheme is not `<IPv4>:<port>` with a valid port.
    #[error("invalid proxy address: {0}")]
    InvalidAddress(String),
}
