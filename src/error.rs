use hyper::StatusCode;
use thiserror::Error;

/// Unified error type for the Rove gateway
#[derive(Error, Debug)]
pub enum RoveError {
    // Pool errors
    #[error("No proxies available")]
    NoProxiesAvailable,

    #[error("All proxies exhausted after {attempts} attempts")]
    AllProxiesExhausted { attempts: u32 },

    #[error("Proxy list fetch failed: {0}")]
    ListFetch(String),

    // Upstream connection errors
    #[error("Proxy connection failed: {0}")]
    ProxyConnectionFailed(String),

    #[error("CONNECT failed: {0}")]
    ConnectFailed(String),

    // Tunnel errors
    #[error("Tunnel error: {0}")]
    TunnelError(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Operation timed out")]
    Timeout,

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),
}

/// Result type alias for Rove operations
pub type Result<T> = std::result::Result<T, RoveError>;

impl RoveError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            RoveError::InvalidRequest(_) | RoveError::InvalidConfig(_) => StatusCode::BAD_REQUEST,

            // Timeout
            RoveError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            // 502 Bad Gateway
            RoveError::ProxyConnectionFailed(_)
            | RoveError::TunnelError(_)
            | RoveError::ConnectFailed(_)
            | RoveError::AllProxiesExhausted { .. } => StatusCode::BAD_GATEWAY,

            // 500 Internal Server Error
            RoveError::NoProxiesAvailable
            | RoveError::ListFetch(_)
            | RoveError::Io(_)
            | RoveError::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

// Convert from hyper errors
impl From<hyper::Error> for RoveError {
    fn from(err: hyper::Error) -> Self {
        RoveError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for RoveError {
    fn from(err: url::ParseError) -> Self {
        RoveError::InvalidConfig(err.to_string())
    }
}
