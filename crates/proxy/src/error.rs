//! Proxy transport errors.

use http::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Failure while forwarding a request to a backend instance.
///
/// Always recoverable: the request is answered with a gateway status and
/// the connection stays usable.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("backend {host} unreachable: {message}")]
    Upstream { host: String, message: String },

    #[error("backend {host} did not respond within {timeout:?}")]
    Timeout { host: String, timeout: Duration },

    #[error("cannot build outbound request: {0}")]
    InvalidRequest(String),
}

impl ProxyError {
    /// Status returned to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Upstream { .. } | Self::InvalidRequest(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}
