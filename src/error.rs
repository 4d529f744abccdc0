use thiserror::Error;

use crate::runner::classify::is_transient_message;

/// Unified error type for the egress pool
#[derive(Error, Debug)]
pub enum EgressError {
    // Policy errors
    #[error("No proxy available")]
    NoProxyAvailable,

    #[error("No paid upstreams configured")]
    NoUpstreamsConfigured,

    #[error("No healthy free proxy candidates ({probed} probed)")]
    NoHealthyCandidates { probed: usize },

    // Proxy errors
    #[error("Proxy connection failed: {0}")]
    ProxyConnectionFailed(String),

    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    #[error("Unsupported proxy protocol: {0}")]
    UnsupportedProtocol(String),

    // Tunnel errors
    #[error("CONNECT failed: {0}")]
    ConnectFailed(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Operation timed out")]
    Timeout,

    // Scheduling errors
    #[error("Timed out after {waited_ms}ms waiting for a worker slot")]
    QueueTimeout { waited_ms: u64 },

    #[error("Queued task cancelled before it started")]
    Cancelled,

    #[error("Run aborted")]
    Aborted,

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // Caller task errors
    #[error("Handler failed: {0}")]
    Handler(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for egress operations
pub type Result<T> = std::result::Result<T, EgressError>;

impl EgressError {
    /// Whether the failure is likely caused by the network path and may be
    /// retried once on a different proxy
    pub fn is_transient(&self) -> bool {
        match self {
            EgressError::ProxyConnectionFailed(_)
            | EgressError::ConnectFailed(_)
            | EgressError::Timeout
            | EgressError::Io(_) => true,
            EgressError::Http(msg) | EgressError::Handler(msg) => is_transient_message(msg),
            _ => false,
        }
    }

    /// Whether the failure comes from configuration or pool policy and must
    /// be surfaced immediately instead of retried
    pub fn is_policy(&self) -> bool {
        matches!(
            self,
            EgressError::NoProxyAvailable
                | EgressError::NoUpstreamsConfigured
                | EgressError::NoHealthyCandidates { .. }
                | EgressError::InvalidConfig(_)
                | EgressError::InvalidProxyAddress(_)
                | EgressError::UnsupportedProtocol(_)
        )
    }
}

// Convert from hyper errors
impl From<hyper::Error> for EgressError {
    fn from(err: hyper::Error) -> Self {
        EgressError::Http(err.to_string())
    }
}

impl From<reqwest::Error> for EgressError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EgressError::Timeout
        } else if err.is_connect() {
            EgressError::ProxyConnectionFailed(err.to_string())
        } else {
            EgressError::Http(err.to_string())
        }
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for EgressError {
    fn from(err: url::ParseError) -> Self {
        EgressError::InvalidProxyAddress(err.to_string())
    }
}
