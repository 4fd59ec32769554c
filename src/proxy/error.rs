//! Error types for proxy operations.
//!
//! Every error that can end a client exchange maps to the status code the
//! client receives:
//! - Client protocol errors: 400 (431 for oversized heads, 413 for bodies)
//! - Unreachable or misbehaving upstreams: 502
//! - Upstream timeouts: 504

use crate::http::ParseError;
use http::StatusCode;
use thiserror::Error;

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error on a socket we own.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The client sent a message we could not parse.
    #[error("Bad client request: {0}")]
    Parse(#[from] ParseError),

    /// Failed to bind a listening socket. Fatal at startup.
    #[error("Proxy bind failed on {addr}: {source}")]
    Bind {
        /// Address we tried to bind.
        addr: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A policy pattern could not be normalized.
    #[error("Invalid policy pattern '{0}'")]
    InvalidPattern(String),

    /// Failed to connect to upstream server.
    #[error("Failed to connect to upstream '{addr}': {message}")]
    UpstreamConnect {
        /// The address we tried to connect to.
        addr: String,
        /// Error message.
        message: String,
    },

    /// The upstream sent something that is not a valid HTTP response.
    #[error("Invalid response from upstream '{addr}': {source}")]
    UpstreamResponse {
        /// Upstream address.
        addr: String,
        /// Parse failure.
        #[source]
        source: ParseError,
    },

    /// An upstream connect or read did not finish in time.
    #[error("Timed out waiting for upstream '{addr}'")]
    Timeout {
        /// Upstream address.
        addr: String,
    },
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    /// Status code reported to the client for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Parse(ParseError::HeadersTooLarge { .. }) => {
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
            }
            ProxyError::Parse(ParseError::BodyTooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::Parse(_) | ProxyError::InvalidPattern(_) => StatusCode::BAD_REQUEST,
            ProxyError::UpstreamConnect { .. } | ProxyError::UpstreamResponse { .. } => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Io(_) | ProxyError::Bind { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_connect_error() {
        let err = ProxyError::UpstreamConnect {
            addr: "api.example.com:443".to_string(),
            message: "connection refused".to_string(),
        };
        assert!(err.to_string().contains("api.example.com:443"));
        assert!(err.to_string().contains("connection refused"));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_client_errors_map_to_4xx() {
        let err = ProxyError::from(ParseError::MalformedStartLine("GET".into()));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = ProxyError::from(ParseError::HeadersTooLarge { limit: 10 });
        assert_eq!(err.status(), StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);

        let err = ProxyError::from(ParseError::BodyTooLarge { limit: 10 });
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn test_upstream_errors_map_to_5xx() {
        let err = ProxyError::UpstreamResponse {
            addr: "example.com:80".into(),
            source: ParseError::Truncated,
        };
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);

        let err = ProxyError::Timeout {
            addr: "example.com:80".into(),
        };
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let proxy_err: ProxyError = io_err.into();
        assert!(matches!(proxy_err, ProxyError::Io(_)));
    }
}
