//! Control socket error types.

use std::io;
use thiserror::Error;

/// Errors from control socket operations.
#[derive(Debug, Error)]
pub enum ControlError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failed to bind the control socket. Fatal at startup.
    #[error("Control socket bind failed on {path}: {source}")]
    Bind {
        /// Socket path.
        path: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Could not reach a running proxy.
    #[error("Cannot connect to proxy control socket {path}: {source} (is `webproxy serve` running?)")]
    Connect {
        /// Socket path.
        path: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Connection closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Message too large.
    #[error("Message too large: {0} bytes (max {1})")]
    MessageTooLarge(usize, usize),
}

/// Result type for control socket operations.
pub type ControlResult<T> = Result<T, ControlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_error_mentions_serve() {
        let err = ControlError::Connect {
            path: "/run/webproxy.sock".to_string(),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        let msg = err.to_string();
        assert!(msg.contains("/run/webproxy.sock"));
        assert!(msg.contains("webproxy serve"));
    }
}
