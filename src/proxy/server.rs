//! Gateway server implementation using hyper
//!
//! Accepts proxy-style client connections and hands each request to the
//! gateway handler.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::config::GatewayConfig;
use crate::error::{Result, RoveError};
use crate::proxy::handler::GatewayHandler;

/// Gateway listener
pub struct GatewayServer {
    config: GatewayConfig,
    handler: Arc<GatewayHandler>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, handler: Arc<GatewayHandler>) -> Self {
        Self { config, handler }
    }

    /// Run the gateway server until shutdown is signalled
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|_| {
                RoveError::InvalidConfig(format!(
                    "Invalid listen address {}:{}",
                    self.config.host, self.config.port
                ))
            })?;

        let listener = TcpListener::bind(addr).await?;
        info!("Gateway listening on {}", addr);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let handler = self.handler.clone();

                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, client_addr, handler).await {
                                    debug!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Gateway server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a single client connection
    async fn handle_connection(
        stream: tokio::net::TcpStream,
        client_addr: SocketAddr,
        handler: Arc<GatewayHandler>,
    ) -> Result<()> {
        debug!("Connection from {}", client_addr);
        let io = TokioIo::new(stream);

        let service = service_fn(move |req| {
            let handler = handler.clone();
            async move { Ok::<_, Infallible>(handler.handle(req).await) }
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .with_upgrades()
            .await
            .map_err(|e| RoveError::ProxyConnectionFailed(e.to_string()))?;

        Ok(())
    }
}
