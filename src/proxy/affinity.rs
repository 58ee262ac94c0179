//! Domain-affinity cache
//!
//! Remembers which upstream proxy last succeeded for a destination domain so
//! the next request to that domain tries the known-good proxy first.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::models::UpstreamProxy;

struct AffinityEntry {
    proxy: Arc<UpstreamProxy>,
    recorded_at: Instant,
}

/// Maps destination domains to the upstream proxy that last worked for them
pub struct DomainAffinityCache {
    entries: DashMap<String, AffinityEntry>,
    ttl: Duration,
}

impl DomainAffinityCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Return the cached proxy for `domain` if present and unexpired.
    ///
    /// An expired entry is treated as absent and removed as a side effect.
    pub fn lookup(&self, domain: &str) -> Option<Arc<UpstreamProxy>> {
        let expired = match self.entries.get(domain) {
            Some(entry) if entry.recorded_at.elapsed() < self.ttl => {
                return Some(entry.proxy.clone())
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            let ttl = self.ttl;
            self.entries
                .remove_if(domain, |_, entry| entry.recorded_at.elapsed() >= ttl);
        }

        None
    }

    /// Unconditionally (over)write the entry for `domain` with a fresh timestamp
    pub fn record_success(&self, domain: &str, proxy: Arc<UpstreamProxy>) {
        self.entries.insert(
            domain.to_string(),
            AffinityEntry {
                proxy,
                recorded_at: Instant::now(),
            },
        );
    }

    /// Remove the entry for `domain` only if it still names `proxy`.
    ///
    /// A concurrent success may have replaced the entry with a different
    /// proxy; that newer entry must survive the invalidation.
    pub fn invalidate(&self, domain: &str, proxy: &UpstreamProxy) {
        self.entries
            .remove_if(domain, |_, entry| *entry.proxy == *proxy);
    }

    /// Clear every entry, returning how many were dropped
    pub fn flush_all(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        if count > 0 {
            debug!("Flushed {} affinity entries", count);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
