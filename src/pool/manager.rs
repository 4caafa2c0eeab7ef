//! Pool manager: the latency-ordered proxy registry.
//!
//! All pool state lives behind one mutex that is never held across an
//! `.await`. The two serve loops drain their own request channels: traffic
//! always gets the current head of the ranking, the checker walks a shuffled
//! snapshot with a per-proxy cooldown.

use crate::config::{CHECK_COOLDOWN, MAX_ERRORS, MIN_HANDSHAKE_DELTA};
use crate::error::UpstreamError;
use crate::pool::channel::{AttemptOutcome, ProxyLease, RequestReceiver};
use crate::pool::proxy::{Proxy, ProxyKind, ProxyStats};
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Default)]
struct PoolInner {
    /// Proxies currently in service.
    live: HashMap<Proxy, ProxyStats>,
    /// Proxies evicted for repeated critical errors.
    quarantine: HashMap<Proxy, ProxyStats>,
    /// Live proxies ordered by handshake average, fastest first. Always a
    /// permutation of the live map's keys.
    ranked: Vec<Proxy>,
}

impl PoolInner {
    fn sort_ranked(&mut self) {
        let live = &self.live;
        self.ranked
            .sort_by_key(|p| live.get(p).map_or(Duration::MAX, |s| s.handshake_avg));
    }

    /// Move every quarantined proxy back into service, keeping its measured
    /// average but forgiving its errors.
    fn rotate(&mut self) {
        for (proxy, mut stats) in self.quarantine.drain() {
            stats.errors = 0;
            self.ranked.push(proxy);
            self.live.insert(proxy, stats);
        }
        self.sort_ranked();
    }
}

/// Concurrent registry of upstream proxies, ranked by observed handshake
/// latency.
///
/// Constructed once at startup and shared via [`Arc`]. The serve loops
/// ([`serve_traffic`](ProxyPool::serve_traffic),
/// [`serve_checker`](ProxyPool::serve_checker)) are long-running tasks; all
/// other operations return immediately.
pub struct ProxyPool {
    inner: Mutex<PoolInner>,
    /// Signaled whenever the live set transitions from empty to non-empty.
    live_nonempty: Notify,
}

impl ProxyPool {
    /// Create an empty pool.
    pub fn new() -> Arc<Self> {
        Arc::new(ProxyPool {
            inner: Mutex::new(PoolInner::default()),
            live_nonempty: Notify::new(),
        })
    }

    /// Register a proxy under the pessimistic seeded latency.
    ///
    /// Re-adding a known identity is a no-op.
    pub fn add_proxy(&self, addr: SocketAddrV4, kind: ProxyKind) {
        let proxy = Proxy { addr, kind };
        let mut inner = self.inner.lock().unwrap();
        if inner.live.contains_key(&proxy) || inner.quarantine.contains_key(&proxy) {
            debug!("proxy {proxy} already registered, skipping");
            return;
        }
        let was_empty = inner.ranked.is_empty();
        inner.live.insert(proxy, ProxyStats::seeded());
        inner.ranked.push(proxy);
        inner.sort_ranked();
        drop(inner);
        if was_empty {
            self.live_nonempty.notify_waiters();
        }
    }

    /// Number of proxies currently in service.
    pub fn live_count(&self) -> usize {
        self.inner.lock().unwrap().live.len()
    }

    /// Number of proxies currently quarantined.
    pub fn quarantine_count(&self) -> usize {
        self.inner.lock().unwrap().quarantine.len()
    }

    /// Snapshot of the ranking, fastest first.
    pub fn ranked(&self) -> Vec<Proxy> {
        self.inner.lock().unwrap().ranked.clone()
    }

    /// Stats of a live proxy, if it is live.
    pub fn stats(&self, proxy: &Proxy) -> Option<ProxyStats> {
        self.inner.lock().unwrap().live.get(proxy).cloned()
    }

    /// Stats of a quarantined proxy, if it is quarantined.
    pub fn quarantined(&self, proxy: &Proxy) -> Option<ProxyStats> {
        self.inner.lock().unwrap().quarantine.get(proxy).cloned()
    }

    /// Account a failed attempt. Only critical errors count; once the
    /// consecutive count exceeds the limit the proxy moves to quarantine in
    /// the same step. No-op if the proxy already left the live set.
    fn add_error(&self, proxy: &Proxy, err: &UpstreamError) {
        if !err.is_critical() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let over_limit = match inner.live.get_mut(proxy) {
            Some(stats) => {
                stats.errors = stats.errors.saturating_add(1);
                stats.last_err = err.to_string();
                stats.errors > MAX_ERRORS
            }
            None => return,
        };
        if over_limit {
            if let Some(stats) = inner.live.remove(proxy) {
                inner.ranked.retain(|p| p != proxy);
                warn!(
                    "proxy {proxy} quarantined after {} errors (last: {})",
                    stats.errors, stats.last_err
                );
                inner.quarantine.insert(*proxy, stats);
            }
        }
    }

    /// Fold a measured duration into the proxy's average.
    ///
    /// Ignores samples within the jitter threshold of the current average;
    /// otherwise halves the distance and re-sorts the ranking. No-op if the
    /// proxy already left the live set.
    fn change_handshake_avg(&self, proxy: &Proxy, sample: Duration) {
        let mut inner = self.inner.lock().unwrap();
        let changed = match inner.live.get_mut(proxy) {
            Some(stats) => {
                let avg = stats.handshake_avg;
                let delta = if sample >= avg { sample - avg } else { avg - sample };
                if delta >= MIN_HANDSHAKE_DELTA {
                    stats.handshake_avg = (avg + sample) / 2;
                    true
                } else {
                    false
                }
            }
            None => return,
        };
        if changed {
            inner.sort_ranked();
            debug!("proxy {proxy} average moved with sample {sample:?}");
        }
    }

    /// Apply an attempt outcome reported on a lease.
    fn apply_outcome(&self, proxy: Proxy, outcome: AttemptOutcome) {
        match outcome {
            Ok(elapsed) if !elapsed.is_zero() => self.change_handshake_avg(&proxy, elapsed),
            Ok(_) => {}
            Err(err) => self.add_error(&proxy, &err),
        }
    }

    /// Current head of the ranking.
    ///
    /// An empty live set triggers the rotation: everything in quarantine
    /// returns to service with its average intact and its errors forgiven.
    /// Returns `None` only when quarantine was empty too.
    fn best_proxy(&self) -> Option<Proxy> {
        let mut inner = self.inner.lock().unwrap();
        if inner.ranked.is_empty() && !inner.quarantine.is_empty() {
            let returning = inner.quarantine.len();
            inner.rotate();
            info!("live set exhausted; rotated {returning} quarantined proxies back in");
            self.live_nonempty.notify_waiters();
        }
        inner.ranked.first().copied()
    }

    /// Park until the live set is non-empty.
    async fn wait_live(&self) {
        loop {
            let notified = self.live_nonempty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.inner.lock().unwrap().ranked.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Wait for an outcome off the serve loop, then account it.
    fn watch_outcome(self: Arc<Self>, proxy: Proxy, outcome_rx: oneshot::Receiver<AttemptOutcome>) {
        tokio::spawn(async move {
            if let Ok(outcome) = outcome_rx.await {
                self.apply_outcome(proxy, outcome);
            }
        });
    }

    /// Serve traffic requests, best proxy first.
    ///
    /// Runs until the request channel closes. Each slot gets the head of the
    /// ranking at the moment the slot is served, not the moment it was
    /// opened; outcomes are awaited concurrently so one slow client cannot
    /// stall the queue.
    pub async fn serve_traffic(self: Arc<Self>, mut requests: RequestReceiver) {
        while let Some(req) = requests.recv().await {
            let proxy = loop {
                match self.best_proxy() {
                    Some(proxy) => break proxy,
                    None => self.wait_live().await,
                }
            };
            let (outcome_tx, outcome_rx) = oneshot::channel();
            let lease = ProxyLease::Granted {
                proxy,
                outcome: outcome_tx,
            };
            if req.lease_tx.send(lease).is_err() {
                // caller went away between opening the slot and the lease
                continue;
            }
            self.clone().watch_outcome(proxy, outcome_rx);
        }
        debug!("traffic request channel closed");
    }

    /// Serve checker requests: shuffled walks over the live set.
    ///
    /// Each pass snapshots the ranking, shuffles it and offers each proxy to
    /// one request slot. A proxy whose previous check started less than the
    /// cooldown ago is skipped; the slot still gets an answer so the worker
    /// can resynchronize. The pass ends by sleeping off the remainder of the
    /// oldest in-flight cooldown, which caps the probe rate.
    pub async fn serve_checker(self: Arc<Self>, mut requests: RequestReceiver) {
        let mut in_flight: HashMap<Proxy, Instant> = HashMap::new();
        loop {
            self.wait_live().await;

            let mut snapshot = self.ranked();
            snapshot.shuffle(&mut rand::thread_rng());

            for proxy in &snapshot {
                let Some(req) = requests.recv().await else {
                    debug!("checker request channel closed");
                    return;
                };
                let due = match in_flight.get(proxy) {
                    Some(started) => started.elapsed() >= CHECK_COOLDOWN,
                    None => true,
                };
                if !due {
                    let _ = req.lease_tx.send(ProxyLease::Skip);
                    continue;
                }
                in_flight.insert(*proxy, Instant::now());
                let (outcome_tx, outcome_rx) = oneshot::channel();
                let lease = ProxyLease::Granted {
                    proxy: *proxy,
                    outcome: outcome_tx,
                };
                if req.lease_tx.send(lease).is_ok() {
                    self.clone().watch_outcome(*proxy, outcome_rx);
                }
            }

            // forget cooldowns of proxies that left the live set
            let seen: HashSet<Proxy> = snapshot.iter().copied().collect();
            in_flight.retain(|proxy, _| seen.contains(proxy));

            if let Some(earliest) = in_flight.values().min().copied() {
                tokio::time::sleep_until(earliest + CHECK_COOLDOWN).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_HANDSHAKE_AVG;
    use crate::pool::channel::{acquire, request_channel};
    use std::io;

    fn addr(last: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new([10, 0, 0, last].into(), port)
    }

    fn proxy(last: u8, port: u16) -> Proxy {
        Proxy {
            addr: addr(last, port),
            kind: ProxyKind::Socks5,
        }
    }

    fn crit_error() -> UpstreamError {
        UpstreamError::io(
            "s5 connect read",
            io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"),
        )
    }

    fn denied_error() -> UpstreamError {
        UpstreamError::Denied {
            stage: "s5 connect read",
            reason: "request not granted",
        }
    }

    fn assert_ranking_consistent(pool: &ProxyPool) {
        let inner = pool.inner.lock().unwrap();
        assert_eq!(inner.ranked.len(), inner.live.len());
        let mut prev = Duration::ZERO;
        for p in &inner.ranked {
            let stats = inner.live.get(p).expect("ranked proxy missing from live");
            assert!(stats.handshake_avg >= prev, "ranking out of order");
            prev = stats.handshake_avg;
        }
        for p in inner.live.keys() {
            assert!(!inner.quarantine.contains_key(p), "proxy in both maps");
        }
    }

    #[test]
    fn test_add_proxy_seeds_and_ranks() {
        let pool = ProxyPool::new();
        pool.add_proxy(addr(1, 1080), ProxyKind::Socks5);
        pool.add_proxy(addr(2, 8080), ProxyKind::Http);

        assert_eq!(pool.live_count(), 2);
        assert_eq!(pool.quarantine_count(), 0);
        let stats = pool.stats(&proxy(1, 1080)).unwrap();
        assert_eq!(stats.handshake_avg, DEFAULT_HANDSHAKE_AVG);
        assert_ranking_consistent(&pool);
    }

    #[test]
    fn test_add_proxy_twice_is_noop() {
        let pool = ProxyPool::new();
        pool.add_proxy(addr(1, 1080), ProxyKind::Socks5);
        pool.add_proxy(addr(1, 1080), ProxyKind::Socks5);
        assert_eq!(pool.live_count(), 1);
        assert_eq!(pool.ranked().len(), 1);
    }

    #[test]
    fn test_denied_error_is_not_counted() {
        let pool = ProxyPool::new();
        pool.add_proxy(addr(1, 1080), ProxyKind::Socks5);

        pool.add_error(&proxy(1, 1080), &denied_error());
        let stats = pool.stats(&proxy(1, 1080)).unwrap();
        assert_eq!(stats.errors, 0);
        assert!(stats.last_err.is_empty());
    }

    #[test]
    fn test_critical_error_counts_by_one() {
        let pool = ProxyPool::new();
        pool.add_proxy(addr(1, 1080), ProxyKind::Socks5);

        pool.add_error(&proxy(1, 1080), &crit_error());
        let stats = pool.stats(&proxy(1, 1080)).unwrap();
        assert_eq!(stats.errors, 1);
        assert!(!stats.last_err.is_empty());

        pool.add_error(&proxy(1, 1080), &crit_error());
        assert_eq!(pool.stats(&proxy(1, 1080)).unwrap().errors, 2);
        assert_ranking_consistent(&pool);
    }

    #[test]
    fn test_third_critical_error_quarantines() {
        let pool = ProxyPool::new();
        pool.add_proxy(addr(1, 1080), ProxyKind::Socks5);
        pool.add_proxy(addr(2, 1080), ProxyKind::Socks5);

        for _ in 0..3 {
            pool.add_error(&proxy(1, 1080), &crit_error());
        }

        assert!(pool.stats(&proxy(1, 1080)).is_none());
        assert!(pool.quarantined(&proxy(1, 1080)).is_some());
        assert_eq!(pool.live_count(), 1);
        assert_eq!(pool.quarantine_count(), 1);
        assert!(!pool.ranked().contains(&proxy(1, 1080)));
        assert_ranking_consistent(&pool);

        // further errors against the departed proxy are no-ops
        pool.add_error(&proxy(1, 1080), &crit_error());
        assert_eq!(pool.quarantined(&proxy(1, 1080)).unwrap().errors, 3);
    }

    #[test]
    fn test_avg_update_below_threshold_is_noop() {
        let pool = ProxyPool::new();
        pool.add_proxy(addr(1, 1080), ProxyKind::Socks5);

        let avg = DEFAULT_HANDSHAKE_AVG;
        pool.change_handshake_avg(&proxy(1, 1080), avg + Duration::from_millis(499));
        assert_eq!(pool.stats(&proxy(1, 1080)).unwrap().handshake_avg, avg);

        pool.change_handshake_avg(&proxy(1, 1080), avg - Duration::from_millis(499));
        assert_eq!(pool.stats(&proxy(1, 1080)).unwrap().handshake_avg, avg);
    }

    #[test]
    fn test_avg_update_halves_the_distance() {
        let pool = ProxyPool::new();
        pool.add_proxy(addr(1, 1080), ProxyKind::Socks5);

        // seeded at 2000ms: 300ms samples walk it down 1150 then 725
        pool.change_handshake_avg(&proxy(1, 1080), Duration::from_millis(300));
        assert_eq!(
            pool.stats(&proxy(1, 1080)).unwrap().handshake_avg,
            Duration::from_millis(1150)
        );
        pool.change_handshake_avg(&proxy(1, 1080), Duration::from_millis(300));
        assert_eq!(
            pool.stats(&proxy(1, 1080)).unwrap().handshake_avg,
            Duration::from_millis(725)
        );
    }

    #[test]
    fn test_measured_proxy_rises_in_ranking() {
        let pool = ProxyPool::new();
        pool.add_proxy(addr(1, 1080), ProxyKind::Socks5);
        pool.add_proxy(addr(2, 1080), ProxyKind::Socks5);

        pool.change_handshake_avg(&proxy(2, 1080), Duration::from_millis(300));
        assert_eq!(pool.ranked().first(), Some(&proxy(2, 1080)));
        assert_ranking_consistent(&pool);
    }

    #[test]
    fn test_rotation_restores_quarantine() {
        let pool = ProxyPool::new();
        pool.add_proxy(addr(1, 1080), ProxyKind::Socks5);

        // establish a measured average, then evict
        pool.change_handshake_avg(&proxy(1, 1080), Duration::from_millis(300));
        let avg_before = pool.stats(&proxy(1, 1080)).unwrap().handshake_avg;
        for _ in 0..3 {
            pool.add_error(&proxy(1, 1080), &crit_error());
        }
        assert_eq!(pool.live_count(), 0);

        // the next head read rotates the quarantine back in
        assert_eq!(pool.best_proxy(), Some(proxy(1, 1080)));
        let stats = pool.stats(&proxy(1, 1080)).unwrap();
        assert_eq!(stats.errors, 0);
        assert_eq!(stats.handshake_avg, avg_before);
        assert_eq!(pool.quarantine_count(), 0);
        assert_ranking_consistent(&pool);
    }

    #[test]
    fn test_best_proxy_on_truly_empty_pool() {
        let pool = ProxyPool::new();
        assert_eq!(pool.best_proxy(), None);
    }

    #[test]
    fn test_ranking_consistency_under_mixed_operations() {
        let pool = ProxyPool::new();
        for i in 0..10u8 {
            pool.add_proxy(addr(i, 1080), ProxyKind::Socks5);
        }
        for i in 0..10u8 {
            pool.change_handshake_avg(&proxy(i, 1080), Duration::from_millis(100 * i as u64));
            if i % 3 == 0 {
                pool.add_error(&proxy(i, 1080), &crit_error());
            }
            if i % 4 == 0 {
                pool.add_error(&proxy(i, 1080), &denied_error());
            }
            assert_ranking_consistent(&pool);
        }
        for _ in 0..3 {
            pool.add_error(&proxy(5, 1080), &crit_error());
        }
        assert_ranking_consistent(&pool);
        assert_eq!(pool.live_count() + pool.quarantine_count(), 10);
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_serve_traffic_delivers_best_and_applies_outcome() {
        let pool = ProxyPool::new();
        pool.add_proxy(addr(1, 1080), ProxyKind::Socks5);
        pool.add_proxy(addr(2, 1080), ProxyKind::Socks5);
        pool.change_handshake_avg(&proxy(2, 1080), Duration::from_millis(300));

        let (tx, rx) = request_channel();
        tokio::spawn(pool.clone().serve_traffic(rx));

        let lease = acquire(&tx).await.unwrap();
        let ProxyLease::Granted { proxy: got, outcome } = lease else {
            panic!("traffic lease must be granted");
        };
        assert_eq!(got, proxy(2, 1080));

        outcome.send(Ok(Duration::from_millis(1300))).ok().unwrap();
        let pool2 = pool.clone();
        wait_for(move || {
            pool2.stats(&proxy(2, 1080)).unwrap().handshake_avg == Duration::from_millis(800)
        })
        .await;
    }

    #[tokio::test]
    async fn test_serve_traffic_quarantines_and_rotates() {
        let pool = ProxyPool::new();
        pool.add_proxy(addr(1, 1080), ProxyKind::Socks5);

        let (tx, rx) = request_channel();
        tokio::spawn(pool.clone().serve_traffic(rx));

        for _ in 0..3 {
            let ProxyLease::Granted { outcome, .. } = acquire(&tx).await.unwrap() else {
                panic!("traffic lease must be granted");
            };
            outcome.send(Err(crit_error())).ok().unwrap();
        }
        let pool2 = pool.clone();
        wait_for(move || pool2.quarantine_count() == 1).await;

        // exhausted pool: the next request triggers the rotation
        let ProxyLease::Granted { proxy: got, .. } = acquire(&tx).await.unwrap() else {
            panic!("traffic lease must be granted");
        };
        assert_eq!(got, proxy(1, 1080));
        assert_eq!(pool.stats(&proxy(1, 1080)).unwrap().errors, 0);
    }

    #[tokio::test]
    async fn test_serve_traffic_waits_for_first_proxy() {
        let pool = ProxyPool::new();
        let (tx, rx) = request_channel();
        tokio::spawn(pool.clone().serve_traffic(rx));

        let waiter = tokio::spawn(async move { acquire(&tx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        pool.add_proxy(addr(1, 1080), ProxyKind::Socks5);
        let lease = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(lease, ProxyLease::Granted { .. }));
    }

    #[tokio::test]
    async fn test_serve_checker_skips_within_cooldown() {
        let pool = ProxyPool::new();
        pool.add_proxy(addr(1, 1080), ProxyKind::Socks5);
        pool.add_proxy(addr(2, 1080), ProxyKind::Socks5);

        let (tx, rx) = request_channel();
        tokio::spawn(pool.clone().serve_checker(rx));

        // first pass: both proxies offered, at staggered times
        let first = acquire(&tx).await.unwrap();
        assert!(matches!(first, ProxyLease::Granted { .. }));
        tokio::time::sleep(Duration::from_millis(600)).await;
        let second = acquire(&tx).await.unwrap();
        assert!(matches!(second, ProxyLease::Granted { .. }));

        // second pass starts when the older cooldown expires; the proxy
        // checked 600ms into the first pass is still cooling down, so the
        // pass yields exactly one skip and one grant
        let mut grants = 0;
        let mut skips = 0;
        for _ in 0..2 {
            match acquire(&tx).await.unwrap() {
                ProxyLease::Granted { .. } => grants += 1,
                ProxyLease::Skip => skips += 1,
            }
        }
        assert_eq!((grants, skips), (1, 1));
    }

    #[tokio::test]
    async fn test_serve_checker_covers_all_proxies_per_pass() {
        let pool = ProxyPool::new();
        for i in 0..5u8 {
            pool.add_proxy(addr(i, 1080), ProxyKind::Socks5);
        }

        let (tx, rx) = request_channel();
        tokio::spawn(pool.clone().serve_checker(rx));

        let mut seen = HashSet::new();
        for _ in 0..5 {
            match acquire(&tx).await.unwrap() {
                ProxyLease::Granted { proxy, .. } => {
                    seen.insert(proxy);
                }
                ProxyLease::Skip => panic!("no cooldown applies on the first pass"),
            }
        }
        assert_eq!(seen.len(), 5);
    }
}
