//! Proxy-list refresh service
//!
//! Fetches the remote proxy list once at startup and then on a fixed
//! interval, replacing the pool's sequence wholesale on success. A failed
//! fetch keeps the previous sequence and is logged, never raised.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, instrument};

use crate::error::{Result, RoveError};
use crate::proxy::pool::ProxyPool;

/// Refresh service configuration
#[derive(Clone)]
pub struct ListRefreshConfig {
    /// URL serving the plaintext proxy list
    pub url: String,
    /// Seconds between refreshes
    pub interval_secs: u64,
    /// Timeout for one list fetch
    pub fetch_timeout_secs: u64,
}

impl Default for ListRefreshConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            interval_secs: 300,
            fetch_timeout_secs: 10,
        }
    }
}

/// Periodically refreshes the upstream proxy pool from the list source
pub struct ListRefreshService {
    pool: Arc<ProxyPool>,
    config: ListRefreshConfig,
    client: reqwest::Client,
}

impl ListRefreshService {
    pub fn new(pool: Arc<ProxyPool>, config: ListRefreshConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            pool,
            config,
            client,
        }
    }

    /// Run the refresh service (call in a spawned task)
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting proxy-list refresh service ({}s interval, source: {})",
            self.config.interval_secs, self.config.url
        );

        // Initial refresh on startup; an unreachable source leaves the pool
        // empty and the timer running.
        self.refresh().await;

        let mut tick = interval(Duration::from_secs(self.config.interval_secs.max(1)));
        tick.tick().await; // Skip immediate tick

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.refresh().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Proxy-list refresh service shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Fetch the list and replace the pool; contained failures only
    async fn refresh(&self) {
        match self.fetch().await {
            Ok(body) => {
                let count = self.pool.apply_list(&body);
                info!("Refreshed proxy list: {} endpoints loaded", count);
            }
            Err(e) => {
                error!("Proxy list refresh failed, keeping previous list: {}", e);
            }
        }
    }

    async fn fetch(&self) -> Result<String> {
        let response = self
            .client
            .get(&self.config.url)
            .send()
            .await
            .map_err(|e| RoveError::ListFetch(e.to_string()))?
            .error_for_status()
            .map_err(|e| RoveError::ListFetch(e.to_string()))?;

        response
            .text()
            .await
            .map_err(|e| RoveError::ListFetch(e.to_string()))
    }
}

/// Handle for managing the refresh service
pub struct ListRefreshHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl ListRefreshHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
