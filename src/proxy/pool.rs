//! Rotating pool of upstream proxy endpoints
//!
//! The sequence is replaced wholesale on every refresh; selections read a
//! consistent snapshot even while a refresh is installing a new list.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::debug;

use crate::models::{ProxyScheme, UpstreamProxy};

/// Round-robin pool of upstream proxies
pub struct ProxyPool {
    proxies: ArcSwap<Vec<Arc<UpstreamProxy>>>,
    cursor: AtomicUsize,
    scheme: ProxyScheme,
}

impl ProxyPool {
    /// Create an empty pool; every endpoint installed later speaks `scheme`
    pub fn new(scheme: ProxyScheme) -> Self {
        Self {
            proxies: ArcSwap::from_pointee(Vec::new()),
            cursor: AtomicUsize::new(0),
            scheme,
        }
    }

    /// Return the endpoint at the cursor and advance it, wrapping modulo the
    /// current sequence length. `None` when the pool is empty.
    pub fn select_next(&self) -> Option<Arc<UpstreamProxy>> {
        let proxies = self.proxies.load();

        if proxies.is_empty() {
            return None;
        }

        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % proxies.len();
        proxies.get(idx).cloned()
    }

    /// Parse a plaintext list body and atomically replace the sequence.
    ///
    /// Each non-blank line is expected as `address:port[:extra-fields...]`;
    /// lines that do not yield an address and port are discarded. Returns the
    /// number of endpoints installed.
    pub fn apply_list(&self, body: &str) -> usize {
        let proxies: Vec<Arc<UpstreamProxy>> = body
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| UpstreamProxy::from_list_line(line, self.scheme))
            .map(Arc::new)
            .collect();

        let count = proxies.len();
        self.proxies.store(Arc::new(proxies));
        // Re-wrap against the new length; exact rotation position is not
        // preserved across a refresh.
        self.cursor.store(0, Ordering::Relaxed);

        debug!("Installed {} upstream proxies", count);
        count
    }

    pub fn len(&self) -> usize {
        self.proxies.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.load().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_next_empty_pool() {
        let pool = ProxyPool::new(ProxyScheme::Http);
        assert!(pool.select_next().is_none());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_rotation_visits_all_before_repeating() {
        let pool = ProxyPool::new(ProxyScheme::Http);
        pool.apply_list("10.0.0.1:8081\n10.0.0.2:8082\n10.0.0.3:8083\n");

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(pool.select_next().unwrap().authority());
        }
        assert_eq!(seen, vec!["10.0.0.1:8081", "10.0.0.2:8082", "10.0.0.3:8083"]);

        // Wraps back to the first endpoint
        assert_eq!(pool.select_next().unwrap().authority(), "10.0.0.1:8081");
    }

    #[test]
    fn test_apply_list_ignores_extra_fields_and_bad_lines() {
        let pool = ProxyPool::new(ProxyScheme::Http);
        let count = pool.apply_list("1.2.3.4:8080:US\n5.6.7.8:3128:DE\n");
        assert_eq!(count, 2);

        let first = pool.select_next().unwrap();
        let second = pool.select_next().unwrap();
        assert_eq!(first.port, 8080);
        assert_eq!(second.port, 3128);

        let count = pool.apply_list("garbage\n\n9.9.9.9:9999\nno-port-here\n");
        assert_eq!(count, 1);
        assert_eq!(pool.select_next().unwrap().authority(), "9.9.9.9:9999");
    }

    #[test]
    fn test_apply_list_replaces_wholesale() {
        let pool = ProxyPool::new(ProxyScheme::Https);
        pool.apply_list("10.0.0.1:1080\n10.0.0.2:1080\n");
        assert_eq!(pool.len(), 2);

        // Hold a selection from the old sequence across the refresh
        let old = pool.select_next().unwrap();

        pool.apply_list("10.1.0.1:3128\n");
        assert_eq!(pool.len(), 1);
        assert_eq!(old.authority(), "10.0.0.1:1080");
        assert_eq!(pool.select_next().unwrap().authority(), "10.1.0.1:3128");
    }
}
