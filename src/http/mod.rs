//! Minimal HTTP/1.x message codec.
//!
//! The proxy parses and re-serializes every message it forwards, so this codec
//! keeps header order and field-name spelling exactly as received. It does not
//! try to be a general-purpose HTTP implementation.
//!
//! # Framing
//!
//! ```text
//! Transfer-Encoding: chunked  -> decoded into one contiguous body
//! Content-Length: N           -> exactly N bytes
//! neither (request)           -> empty body
//! neither (response)          -> read until the peer closes
//! HEAD, 1xx, 204, 304         -> no body
//! ```
//!
//! Forwarded messages are always re-framed with `Content-Length`.

mod error;
mod headers;
mod message;
mod parse;

pub use error::ParseError;
pub use headers::Headers;
pub use message::{
    HTTP_PORT, HTTPS_PORT, Request, Response, Target, Version, parse_host_port,
    status_allows_body,
};
pub use parse::{
    BodyKind, Limits, read_body, read_request, read_request_body, read_request_head,
    read_response, request_body_kind, response_body_kind,
};
