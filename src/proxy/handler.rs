//! Gateway request handling with retry and failover
//!
//! Classifies inbound requests by method: plain proxy-style requests are
//! forwarded through an upstream proxy, `CONNECT` requests become raw byte
//! tunnels. Both paths pick candidates the same way: the domain's last-good
//! proxy first, pool rotation after that.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::request::Parts;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::config::DEFAULT_USER_AGENT;
use crate::error::{Result, RoveError};
use crate::models::UpstreamProxy;
use crate::proxy::affinity::DomainAffinityCache;
use crate::proxy::agent::{
    connect_handshake, parse_authority, BoxedConnection, Target, TargetScheme, TunnelAgentFactory,
};
use crate::proxy::pool::ProxyPool;
use crate::proxy::tunnel;

const DEFAULT_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";
const DEFAULT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

/// Response body type unifying streamed upstream bodies and generated ones
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Configuration for the gateway handler
#[derive(Clone)]
pub struct GatewayHandlerConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Per-attempt timeout on the plain forwarding path
    pub request_timeout: Duration,
    /// User-Agent substituted when the client sends none
    pub user_agent: String,
}

impl Default for GatewayHandlerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            request_timeout: Duration::from_secs(10),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// Gateway request handler
pub struct GatewayHandler {
    pool: Arc<ProxyPool>,
    affinity: Arc<DomainAffinityCache>,
    agents: TunnelAgentFactory,
    config: GatewayHandlerConfig,
}

impl GatewayHandler {
    pub fn new(
        pool: Arc<ProxyPool>,
        affinity: Arc<DomainAffinityCache>,
        agents: TunnelAgentFactory,
        config: GatewayHandlerConfig,
    ) -> Self {
        Self {
            pool,
            affinity,
            agents,
            config,
        }
    }

    /// Handle an incoming request, dispatching by method
    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    pub async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        if req.method() == Method::CONNECT {
            return self.handle_connect(req).await;
        }

        self.handle_http(req).await
    }

    /// Pick the candidate proxy for an attempt.
    ///
    /// Attempt 0 honors the domain's affinity entry when one exists; later
    /// attempts (and affinity misses) rotate the pool. The bool reports
    /// whether the candidate came from the affinity cache.
    fn select_candidate(&self, attempt: u32, domain: &str) -> Option<(Arc<UpstreamProxy>, bool)> {
        if attempt == 0 {
            if let Some(proxy) = self.affinity.lookup(domain) {
                debug!("Affinity hit for {}: {}", domain, proxy);
                return Some((proxy, true));
            }
        }

        self.pool.select_next().map(|proxy| (proxy, false))
    }

    /// Handle a plain proxy-style HTTP request
    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    async fn handle_http(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let target = match Target::from_uri(req.uri()) {
            Ok(target) => target,
            Err(e) => {
                debug!("Rejecting request: {}", e);
                return text_response(StatusCode::BAD_REQUEST, &e.to_string());
            }
        };

        let (parts, body) = req.into_parts();

        // Buffered once so failed attempts can be replayed against another
        // proxy; the response body still streams.
        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return text_response(
                    StatusCode::BAD_REQUEST,
                    &format!("Failed to read request body: {}", e),
                )
            }
        };

        let headers = self.sanitize_headers(&parts.headers, &target);

        let max_attempts = self.config.max_retries + 1;
        let mut last_error: Option<RoveError> = None;

        for attempt in 0..max_attempts {
            let Some((candidate, from_affinity)) = self.select_candidate(attempt, &target.host)
            else {
                error!("No proxies available for {}", target.host);
                return json_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "no proxies available" }),
                );
            };

            debug!(
                "Forwarding {} {} through {} (attempt {}/{})",
                parts.method, parts.uri, candidate, attempt + 1, max_attempts
            );

            match tokio::time::timeout(
                self.config.request_timeout,
                self.forward_request(&candidate, &target, &parts, headers.clone(), body_bytes.clone()),
            )
            .await
            {
                Ok(Ok(response)) => {
                    self.affinity.record_success(&target.host, candidate.clone());
                    info!(
                        "{} {} -> {} via {}",
                        parts.method, parts.uri, response.status(), candidate
                    );
                    return response.map(|body| body.boxed());
                }
                Ok(Err(e)) => {
                    warn!(
                        "Request through {} failed: {} (attempt {}/{})",
                        candidate, e, attempt + 1, max_attempts
                    );
                    if from_affinity {
                        self.affinity.invalidate(&target.host, &candidate);
                    }
                    last_error = Some(e);
                }
                Err(_) => {
                    warn!(
                        "Request through {} timed out (attempt {}/{})",
                        candidate, attempt + 1, max_attempts
                    );
                    if from_affinity {
                        self.affinity.invalidate(&target.host, &candidate);
                    }
                    last_error = Some(RoveError::Timeout);
                }
            }
        }

        let last = last_error.unwrap_or(RoveError::NoProxiesAvailable);
        error!(
            "All attempts for {} {} failed after {}: {}",
            parts.method, parts.uri, max_attempts, last
        );

        json_response(
            StatusCode::BAD_GATEWAY,
            json!({
                "error": "all upstream proxies failed",
                "details": last.to_string(),
            }),
        )
    }

    /// Dispatch one attempt through the given proxy, returning the upstream
    /// response with its body still streaming
    async fn forward_request(
        &self,
        proxy: &UpstreamProxy,
        target: &Target,
        parts: &Parts,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<Response<Incoming>> {
        let stream = self.agents.open(target, proxy).await?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| RoveError::ProxyConnectionFailed(format!("Handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Upstream connection ended: {}", e);
            }
        });

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        // An http target gets the absolute-form URI the proxy expects; an
        // https target already rides a tunnel to the origin, so origin-form.
        let uri_str = match target.scheme {
            TargetScheme::Http => format!("http://{}{}", target.host_header(), path_and_query),
            TargetScheme::Https => path_and_query.to_string(),
        };

        let mut builder = Request::builder().method(parts.method.clone()).uri(&uri_str);
        for (name, value) in headers.iter() {
            builder = builder.header(name, value);
        }

        let request = builder
            .body(Full::new(body))
            .map_err(|e| RoveError::InvalidRequest(format!("Failed to build request: {}", e)))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| RoveError::ProxyConnectionFailed(format!("Request failed: {}", e)))?;

        Ok(response)
    }

    /// Handle a CONNECT tunnel request
    #[instrument(skip(self, req), fields(uri = %req.uri()))]
    async fn handle_connect(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let uri = req.uri().clone();
        let authority = uri
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| uri.to_string());

        let (target_host, target_port) = parse_authority(&authority);

        let max_attempts = self.config.max_retries + 1;
        let mut last_error: Option<RoveError> = None;
        let mut established: Option<(Arc<UpstreamProxy>, BoxedConnection)> = None;

        for attempt in 0..max_attempts {
            let Some((candidate, from_affinity)) = self.select_candidate(attempt, &target_host)
            else {
                error!("No proxies available for CONNECT {}", authority);
                return status_response(StatusCode::BAD_GATEWAY);
            };

            debug!(
                "CONNECT {} through {} (attempt {}/{})",
                authority, candidate, attempt + 1, max_attempts
            );

            match self
                .establish_tunnel(&candidate, &target_host, target_port)
                .await
            {
                Ok(stream) => {
                    established = Some((candidate, stream));
                    break;
                }
                Err(e) => {
                    warn!(
                        "CONNECT {} through {} failed: {} (attempt {}/{})",
                        authority, candidate, e, attempt + 1, max_attempts
                    );
                    if from_affinity {
                        self.affinity.invalidate(&target_host, &candidate);
                    }
                    last_error = Some(e);
                }
            }
        }

        let Some((proxy, upstream)) = established else {
            error!(
                "CONNECT {} failed after {} attempts: {}",
                authority,
                max_attempts,
                last_error.unwrap_or(RoveError::NoProxiesAvailable)
            );
            return status_response(StatusCode::BAD_GATEWAY);
        };

        self.affinity.record_success(&target_host, proxy.clone());
        info!("CONNECT tunnel established to {} via {}", authority, proxy);

        // The relay starts once the client's connection upgrades; bytes the
        // client pipelined before the 200 are preserved in hyper's upgrade
        // buffer.
        let on_upgrade = hyper::upgrade::on(req);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let client = TokioIo::new(upgraded);
                    if let Err(e) = tunnel::relay(client, upstream).await {
                        error!("Tunnel relay via {} failed: {}", proxy, e);
                    }
                }
                Err(e) => {
                    debug!("CONNECT upgrade failed: {}", e);
                }
            }
        });

        status_response(StatusCode::OK)
    }

    /// Dial the candidate proxy and perform the CONNECT handshake.
    ///
    /// No explicit timeout here: the upstream connection's own error/close
    /// bounds the wait, and a failed attempt drops the proxy-side socket.
    async fn establish_tunnel(
        &self,
        proxy: &UpstreamProxy,
        host: &str,
        port: u16,
    ) -> Result<BoxedConnection> {
        let mut stream = self.agents.dial_proxy(proxy).await?;
        connect_handshake(&mut stream, host, port).await?;
        Ok(stream)
    }

    /// Strip headers the transport layer recomputes and substitute defaults
    /// so outbound requests resemble ordinary browser traffic
    fn sanitize_headers(&self, inbound: &HeaderMap, target: &Target) -> HeaderMap {
        let mut headers = HeaderMap::new();

        for (name, value) in inbound {
            if name == header::HOST
                || name == header::CONTENT_LENGTH
                || is_hop_by_hop_header(name.as_str())
            {
                continue;
            }
            headers.append(name, value.clone());
        }

        if let Ok(host) = HeaderValue::from_str(&target.host_header()) {
            headers.insert(header::HOST, host);
        }
        if !headers.contains_key(header::USER_AGENT) {
            if let Ok(ua) = HeaderValue::from_str(&self.config.user_agent) {
                headers.insert(header::USER_AGENT, ua);
            }
        }
        if !headers.contains_key(header::ACCEPT) {
            headers.insert(header::ACCEPT, HeaderValue::from_static(DEFAULT_ACCEPT));
        }
        if !headers.contains_key(header::ACCEPT_LANGUAGE) {
            headers.insert(
                header::ACCEPT_LANGUAGE,
                HeaderValue::from_static(DEFAULT_ACCEPT_LANGUAGE),
            );
        }

        headers
    }
}

/// Check if a header is a hop-by-hop header that should not be forwarded
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(full_body(message.to_string()))
        .unwrap()
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(full_body(body.to_string()))
        .unwrap()
}

fn status_response(status: StatusCode) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .body(empty_body())
        .unwrap()
}
