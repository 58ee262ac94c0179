//! Periodic affinity-cache flush
//!
//! Clears every affinity entry on the same interval as the proxy-list
//! refresh. This bounds memory and forces periodic re-discovery of the best
//! proxy per domain even for entries that have not individually expired.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{info, instrument};

use crate::proxy::affinity::DomainAffinityCache;

/// Periodically flushes the domain-affinity cache
pub struct CacheFlushService {
    cache: Arc<DomainAffinityCache>,
    interval_secs: u64,
}

impl CacheFlushService {
    /// `interval_secs` is the proxy-list refresh interval; the flush shares
    /// it rather than having its own tunable clock.
    pub fn new(cache: Arc<DomainAffinityCache>, interval_secs: u64) -> Self {
        Self {
            cache,
            interval_secs,
        }
    }

    /// Run the flush service (call in a spawned task)
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting affinity-cache flush service ({}s interval)",
            self.interval_secs
        );

        let mut tick = interval(Duration::from_secs(self.interval_secs.max(1)));
        tick.tick().await; // Skip immediate tick

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let flushed = self.cache.flush_all();
                    info!("Affinity cache flushed ({} entries dropped)", flushed);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Affinity-cache flush service shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Handle for managing the flush service
pub struct CacheFlushHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl CacheFlushHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProxyScheme, UpstreamProxy};

    #[tokio::test]
    async fn test_flush_service_shutdown() {
        let cache = Arc::new(DomainAffinityCache::new(Duration::from_secs(60)));
        cache.record_success(
            "example.com",
            Arc::new(UpstreamProxy::new(ProxyScheme::Http, "1.2.3.4", 8080)),
        );

        let service = CacheFlushService::new(cache.clone(), 3600);
        let (handle, shutdown) = CacheFlushHandle::new();
        let task = tokio::spawn(async move { service.run(shutdown).await });

        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("service did not shut down")
            .unwrap();

        // No flush fired within the long interval; entries are intact
        assert_eq!(cache.len(), 1);
    }
}
