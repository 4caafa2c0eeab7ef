//! Request-slot channel types for pool hand-offs.
//!
//! A request slot is a single-use, bidirectional exchange: the caller sends
//! a [`ProxyRequest`] on the shared request channel, the pool answers with a
//! [`ProxyLease`], and the caller reports the attempt's outcome back on the
//! lease. Slots are private to one exchange; nothing is ever reused.

use crate::error::UpstreamError;
use crate::pool::proxy::Proxy;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Outcome of one upstream attempt, reported back to the pool: the measured
/// dial-plus-handshake duration, or the error that ended the attempt.
pub type AttemptOutcome = Result<Duration, UpstreamError>;

/// A single-use request for a proxy.
pub struct ProxyRequest {
    pub(crate) lease_tx: oneshot::Sender<ProxyLease>,
}

/// The pool's answer to a [`ProxyRequest`].
pub enum ProxyLease {
    /// A proxy to try. Report the attempt on `outcome`; dropping the sender
    /// without reporting is safe and simply discards the sample.
    Granted {
        /// The proxy the pool picked.
        proxy: Proxy,
        /// Where the attempt's outcome goes.
        outcome: oneshot::Sender<AttemptOutcome>,
    },
    /// The pool declined this slot (check cooldown); try again shortly.
    Skip,
}

/// Sender half used by the front end and the checker workers.
pub type RequestSender = mpsc::Sender<ProxyRequest>;

/// Receiver half consumed by one of the pool's serve loops.
pub type RequestReceiver = mpsc::Receiver<ProxyRequest>;

/// Create a request channel.
///
/// Capacity one is the closest tokio gets to a rendezvous channel: the serve
/// loop's pace back-pressures callers instead of queueing them.
pub fn request_channel() -> (RequestSender, RequestReceiver) {
    mpsc::channel(1)
}

/// Open a fresh slot on `requests` and wait for the pool's lease.
///
/// Returns `None` when the pool's serve loop is gone.
pub async fn acquire(requests: &RequestSender) -> Option<ProxyLease> {
    let (lease_tx, lease_rx) = oneshot::channel();
    requests.send(ProxyRequest { lease_tx }).await.ok()?;
    lease_rx.await.ok()
}
