//! Tuning constants for the gateway.
//!
//! Everything time-related that shapes the pool's behavior lives here, so
//! the relationships between the knobs stay visible in one place.

use std::time::Duration;

// Upstream connector

/// Deadline for the TCP dial to an upstream proxy.
pub const UPSTREAM_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Deadline covering all CONNECT handshake I/O after the dial. Includes the
/// proxy's own connect to the requested target, so it dominates the measured
/// latency of a healthy proxy.
pub const UPSTREAM_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Read buffer for proxy-side handshake replies.
pub const PROXY_READ_BUF: usize = 16 * 1024;

/// User agent sent to HTTP/HTTPS proxies and the reference endpoint.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/128.0.0.0 Safari/537.36";

// Proxy pool

/// Maximum consecutive critical errors before a proxy is quarantined.
pub const MAX_ERRORS: u8 = 2;

/// Seeded latency for proxies that have never completed a handshake. Must
/// exceed the handshake deadline so unproven proxies sink below proven ones.
pub const DEFAULT_HANDSHAKE_AVG: Duration =
    UPSTREAM_HANDSHAKE_TIMEOUT.saturating_add(Duration::from_secs(1));

/// Smallest latency shift that moves the handshake average. Keeps jitter
/// from re-sorting the ranking on every sample.
pub const MIN_HANDSHAKE_DELTA: Duration = Duration::from_millis(500);

/// Minimum spacing between two health checks of the same proxy.
pub const CHECK_COOLDOWN: Duration = Duration::from_secs(1);

// Health checker

/// Host probed through each proxy. Port 443, HTTPS only.
pub const CHECK_HOST: &str = "www.gstatic.com";

/// Port of the reference endpoint.
pub const CHECK_PORT: u16 = 443;

/// Path probed on the reference host.
pub const CHECK_PATH: &str = "/generate_204";

/// Deadline for the probe past the CONNECT stage: remote TLS handshake,
/// request and response.
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(1);

/// Read buffer for the probe response.
pub const CHECK_READ_BUF: usize = 4 * 1024;

/// Pause each worker takes after finishing a check.
pub const CHECK_PAUSE: Duration = Duration::from_secs(2);

/// Backoff a worker takes when the pool declines its slot.
pub const CHECK_SKIP_BACKOFF: Duration = Duration::from_millis(100);

/// Stagger between checker worker launches.
pub const WORKER_STAGGER: Duration = Duration::from_millis(100);

/// Default number of checker workers.
pub const DEFAULT_CHECK_WORKERS: usize = 10;

// SOCKS5 front end

/// Default listen address.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:1080";

/// Additional proxy acquisition attempts after the first one fails.
pub const MAX_RETRIES: u32 = 2;

/// Pause between proxy acquisition attempts.
pub const RETRY_COOLDOWN: Duration = Duration::from_millis(500);
