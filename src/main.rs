//! Rove Gateway - Entry Point
//!
//! Starts the gateway server and its background services with graceful
//! shutdown support.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod error;
mod models;
mod proxy;
mod services;

use config::Config;
use proxy::affinity::DomainAffinityCache;
use proxy::agent::TunnelAgentFactory;
use proxy::handler::{GatewayHandler, GatewayHandlerConfig};
use proxy::pool::ProxyPool;
use proxy::server::GatewayServer;
use services::{
    CacheFlushHandle, CacheFlushService, ListRefreshConfig, ListRefreshHandle, ListRefreshService,
};

#[tokio::main]
async fn main() -> error::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rove=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Rove Gateway");

    // Load configuration
    let config = Config::from_env()?;
    info!("Configuration loaded");

    // Core components: one pool, one affinity cache, one agent factory,
    // shared by every request
    let pool = Arc::new(ProxyPool::new(config.list.upstream_scheme));
    let affinity = Arc::new(DomainAffinityCache::new(Duration::from_secs(
        config.affinity.ttl,
    )));
    let agents = TunnelAgentFactory::new();

    let handler = Arc::new(GatewayHandler::new(
        pool.clone(),
        affinity.clone(),
        agents,
        GatewayHandlerConfig {
            max_retries: config.gateway.max_retries,
            request_timeout: Duration::from_secs(config.gateway.request_timeout),
            user_agent: config.gateway.user_agent.clone(),
        },
    ));

    // Start proxy-list refresh service
    let (refresh_handle, refresh_shutdown) = ListRefreshHandle::new();
    let refresh_service = ListRefreshService::new(
        pool.clone(),
        ListRefreshConfig {
            url: config.list.url.clone(),
            interval_secs: config.list.refresh_interval,
            fetch_timeout_secs: config.gateway.connect_timeout,
        },
    );
    let refresh_task = tokio::spawn(async move {
        refresh_service.run(refresh_shutdown).await;
    });

    // Start affinity-cache flush service (shares the refresh interval)
    let (flush_handle, flush_shutdown) = CacheFlushHandle::new();
    let flush_service = CacheFlushService::new(affinity.clone(), config.list.refresh_interval);
    let flush_task = tokio::spawn(async move {
        flush_service.run(flush_shutdown).await;
    });

    // Start gateway server
    let (shutdown_tx, _) = watch::channel(false);
    let server = GatewayServer::new(config.gateway.clone(), handler);
    let server_shutdown = shutdown_tx.subscribe();

    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run(server_shutdown).await {
            error!("Gateway server error: {}", e);
        }
    });

    info!(
        "Gateway started on {}:{}",
        config.gateway.host, config.gateway.port
    );

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    // Send shutdown signal to all services
    let _ = shutdown_tx.send(true);
    refresh_handle.shutdown();
    flush_handle.shutdown();

    // Wait for all tasks to complete
    let _ = tokio::join!(server_task, refresh_task, flush_task);

    info!("Rove Gateway stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
