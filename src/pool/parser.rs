//! Proxy list file loading.
//!
//! One URL per line, `scheme://IPv4:port`. Malformed lines are warned and
//! skipped; only an unreadable file aborts startup.

use crate::pool::proxy::Proxy;
use crate::pool::ProxyPool;
use anyhow::{Context, Result};
use std::path::Path;
use tracing::warn;

/// Load a proxy list file into the pool. Returns how many proxies were
/// registered.
pub fn load_proxy_file(pool: &ProxyPool, path: &Path) -> Result<usize> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read proxy list: {}", path.display()))?;
    Ok(load_proxy_list(pool, &content))
}

/// Parse proxy list content line by line, registering every valid entry.
pub fn load_proxy_list(pool: &ProxyPool, content: &str) -> usize {
    let mut added = 0;
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.parse::<Proxy>() {
            Ok(proxy) => {
                pool.add_proxy(proxy.addr, proxy.kind);
                added += 1;
            }
            Err(err) => warn!("line {}: skipped ({err})", idx + 1),
        }
    }
    added
}
