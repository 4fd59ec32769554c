//! Codec error types.

use thiserror::Error;

/// Errors produced while parsing an HTTP/1.x message from a byte stream.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The request or status line is missing a component or is not HTTP/1.x.
    #[error("Malformed start line: {0}")]
    MalformedStartLine(String),

    /// A header line has no colon or an invalid field name.
    #[error("Malformed header line: {0}")]
    MalformedHeader(String),

    /// The start line plus header block exceeded the configured maximum.
    #[error("Header block exceeds {limit} bytes")]
    HeadersTooLarge {
        /// Configured maximum in bytes.
        limit: usize,
    },

    /// The message body exceeded the configured maximum.
    #[error("Body exceeds {limit} bytes")]
    BodyTooLarge {
        /// Configured maximum in bytes.
        limit: usize,
    },

    /// Content-Length is not a number, or several values disagree.
    #[error("Invalid Content-Length: {0}")]
    InvalidContentLength(String),

    /// A chunk-size line could not be decoded.
    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),

    /// The request uses a transfer coding we cannot decode.
    #[error("Unsupported transfer encoding: {0}")]
    UnsupportedTransferEncoding(String),

    /// The request target cannot be resolved to a host.
    #[error("Invalid request target: {0}")]
    InvalidTarget(String),

    /// The peer closed the stream in the middle of a message.
    #[error("Message truncated")]
    Truncated,

    /// Underlying socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ParseError {
    /// Whether the peer misbehaved, as opposed to the socket failing.
    pub fn is_protocol_error(&self) -> bool {
        !matches!(self, ParseError::Io(_) | ParseError::Truncated)
    }
}
