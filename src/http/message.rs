//! Request, response and target types.

use super::error::ParseError;
use super::headers::Headers;
use bytes::Bytes;
use http::{Method, StatusCode, Uri};
use std::fmt;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Default port for plain HTTP targets.
pub const HTTP_PORT: u16 = 80;

/// Default port for CONNECT targets.
pub const HTTPS_PORT: u16 = 443;

/// Body of the page served for blocked requests.
const BLOCKED_PAGE: &str = "<html><head><title>403 Forbidden</title></head><body><h1>403 Forbidden</h1><p>This page has been blocked by the proxy server.</p></body></html>";

/// HTTP protocol version on the start line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// HTTP/1.0
    Http10,
    /// HTTP/1.1
    Http11,
}

impl Version {
    /// Version for the minor number of an `HTTP/1.x` start line.
    pub fn from_minor(minor: u8) -> Option<Self> {
        match minor {
            0 => Some(Version::Http10),
            1 => Some(Version::Http11),
            _ => None,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::Http10 => write!(f, "HTTP/1.0"),
            Version::Http11 => write!(f, "HTTP/1.1"),
        }
    }
}

/// Resolved destination of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Lowercase scheme, `http` for proxied requests and `https` for tunnels.
    pub scheme: String,
    /// Lowercase host without IPv6 brackets.
    pub host: String,
    /// Effective port.
    pub port: u16,
    /// Origin-form path and query, always starting with `/` for HTTP targets.
    pub path_and_query: String,
}

impl Target {
    /// Resolve the target of a parsed request head.
    ///
    /// Accepts authority-form for CONNECT, absolute-form `http://` URIs, and
    /// origin-form paths resolved through the `Host` header.
    pub fn from_request(
        method: &Method,
        raw_target: &str,
        headers: &Headers,
    ) -> Result<Self, ParseError> {
        if method == Method::CONNECT {
            let (host, port) = parse_host_port(raw_target, HTTPS_PORT)?;
            return Ok(Self {
                scheme: "https".to_string(),
                host,
                port,
                path_and_query: String::new(),
            });
        }

        if raw_target.starts_with('/') {
            let host_header = headers.get("host").ok_or_else(|| {
                ParseError::InvalidTarget(format!("{} without Host header", raw_target))
            })?;
            let (host, port) = parse_host_port(host_header.trim(), HTTP_PORT)?;
            return Ok(Self {
                scheme: "http".to_string(),
                host,
                port,
                path_and_query: raw_target.to_string(),
            });
        }

        let uri: Uri = raw_target
            .parse()
            .map_err(|e| ParseError::InvalidTarget(format!("{}: {}", raw_target, e)))?;

        let scheme = uri
            .scheme_str()
            .ok_or_else(|| ParseError::InvalidTarget(format!("{}: missing scheme", raw_target)))?
            .to_ascii_lowercase();
        if scheme != "http" {
            return Err(ParseError::InvalidTarget(format!(
                "unsupported scheme '{}'",
                scheme
            )));
        }

        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ParseError::InvalidTarget(format!("{}: missing host", raw_target)))?;
        let host = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_ascii_lowercase();

        let path_and_query = match uri.path_and_query().map(|pq| pq.as_str()) {
            Some(pq) if pq.starts_with('/') => pq.to_string(),
            Some(pq) if !pq.is_empty() => format!("/{}", pq),
            _ => "/".to_string(),
        };

        Ok(Self {
            scheme,
            host,
            port: uri.port_u16().unwrap_or(HTTP_PORT),
            path_and_query,
        })
    }

    /// `host:port`, with brackets around IPv6 literals.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.bracketed_host(), self.port)
    }

    /// Value for a `Host` header; the default port for the scheme is elided.
    pub fn host_header(&self) -> String {
        if self.port == self.default_port() {
            self.bracketed_host()
        } else {
            self.authority()
        }
    }

    /// Path without the query string.
    pub fn path(&self) -> &str {
        self.path_and_query
            .split_once('?')
            .map(|(path, _)| path)
            .unwrap_or(&self.path_and_query)
    }

    /// Normalized absolute URL, used as the cache key.
    pub fn absolute_url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.host_header(), self.path_and_query)
    }

    fn default_port(&self) -> u16 {
        if self.scheme == "https" {
            HTTPS_PORT
        } else {
            HTTP_PORT
        }
    }

    fn bracketed_host(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scheme == "https" {
            write!(f, "{}", self.authority())
        } else {
            write!(f, "{}", self.absolute_url())
        }
    }
}

/// Parse `host[:port]` as found in CONNECT lines and `Host` headers.
///
/// - `api.example.com:8443` -> ("api.example.com", 8443)
/// - `api.example.com` -> ("api.example.com", default_port)
/// - `[::1]:443` -> ("::1", 443)
pub fn parse_host_port(authority: &str, default_port: u16) -> Result<(String, u16), ParseError> {
    let invalid = || ParseError::InvalidTarget(format!("invalid authority '{}'", authority));

    if authority.is_empty() || authority.contains(['/', ' ', '@']) {
        return Err(invalid());
    }

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
        match after.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if after.is_empty() => (host, None),
            None => return Err(invalid()),
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => (host, Some(port)),
            Some(_) => return Err(invalid()),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(invalid());
    }

    let port = match port {
        Some(p) => p
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| ParseError::InvalidTarget(format!("invalid port '{}'", p)))?,
        None => default_port,
    };

    Ok((host.to_ascii_lowercase(), port))
}

/// A parsed HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Request method.
    pub method: Method,
    /// Request target exactly as it appeared on the request line.
    pub target: String,
    /// Protocol version.
    pub version: Version,
    /// Header fields in wire order.
    pub headers: Headers,
    /// Decoded body.
    pub body: Bytes,
}

impl Request {
    /// Create a body-less request.
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            version: Version::Http11,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Whether the client asked to close the connection after this exchange.
    pub fn wants_close(&self) -> bool {
        let says = |token: &str| {
            self.headers.has_token("connection", token)
                || self.headers.has_token("proxy-connection", token)
        };
        match self.version {
            Version::Http10 => !says("keep-alive"),
            Version::Http11 => says("close"),
        }
    }

    /// Whether the client waits for `100 Continue` before sending its body.
    pub fn expects_continue(&self) -> bool {
        self.headers.has_token("expect", "100-continue")
    }

    /// Build the request sent to the origin server.
    ///
    /// The target is rewritten to origin-form, hop-by-hop fields are dropped,
    /// `Host` is set from the resolved target, and the connection is marked
    /// non-persistent so the response can always be delimited by EOF.
    pub fn to_upstream(&self, target: &Target) -> Request {
        let mut headers = self.headers.clone();
        let had_framing = headers.contains("content-length") || headers.contains("transfer-encoding");
        headers.strip_hop_by_hop();
        headers.remove("expect");
        headers.set("Host", target.host_header());
        if had_framing || !self.body.is_empty() {
            headers.set("Content-Length", self.body.len().to_string());
        }
        headers.set("Connection", "close");

        Request {
            method: self.method.clone(),
            target: target.path_and_query.clone(),
            version: Version::Http11,
            headers,
            body: self.body.clone(),
        }
    }

    /// Serialize to wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, self.target, self.version).into_bytes();
        write_headers(&mut out, &self.headers);
        out.extend_from_slice(&self.body);
        out
    }

    /// Write the serialized request and flush.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.to_bytes()).await?;
        writer.flush().await
    }
}

/// A parsed or synthesized HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Protocol version.
    pub version: Version,
    /// Status code.
    pub status: StatusCode,
    /// Reason phrase, possibly empty.
    pub reason: String,
    /// Header fields in wire order.
    pub headers: Headers,
    /// Decoded body.
    pub body: Bytes,
}

impl Response {
    /// Create an empty response with the canonical reason phrase.
    pub fn new(status: StatusCode) -> Self {
        Self {
            version: Version::Http11,
            status,
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Create a response carrying `body` with the given content type.
    pub fn with_body(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        let mut response = Self::new(status);
        response.headers.append("Content-Type", content_type);
        response
            .headers
            .append("Content-Length", body.len().to_string());
        response.body = body;
        response
    }

    /// The page served when the policy blocks a request.
    pub fn blocked() -> Self {
        Self::with_body(StatusCode::FORBIDDEN, "text/html", BLOCKED_PAGE)
    }

    /// A small HTML error page for locally handled failures.
    pub fn error(status: StatusCode, detail: &str) -> Self {
        let title = format!(
            "{} {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Error")
        );
        let page = format!(
            "<html><head><title>{title}</title></head><body><h1>{title}</h1><p>{}</p></body></html>",
            escape_html(detail)
        );
        Self::with_body(status, "text/html", page)
    }

    /// The status line that opens a CONNECT tunnel.
    pub fn connection_established() -> Self {
        let mut response = Self::new(StatusCode::OK);
        response.reason = "Connection Established".to_string();
        response
    }

    /// Bare status line with no headers or body, used to refuse a tunnel.
    pub fn status_only(status: StatusCode) -> Self {
        Self::new(status)
    }

    /// Normalize framing before the response is stored or relayed.
    ///
    /// Hop-by-hop fields are dropped and, when the response carries a body,
    /// `Content-Length` is set from the decoded body. Responses to HEAD keep
    /// the origin's `Content-Length`.
    pub fn into_forwardable(mut self, request_method: &Method) -> Self {
        self.headers.strip_hop_by_hop();
        if status_allows_body(request_method, self.status) {
            self.headers
                .set("Content-Length", self.body.len().to_string());
        }
        self
    }

    /// Serialize to wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!(
            "{} {} {}\r\n",
            self.version,
            self.status.as_u16(),
            self.reason
        )
        .into_bytes();
        write_headers(&mut out, &self.headers);
        out.extend_from_slice(&self.body);
        out
    }

    /// Write the serialized response and flush.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.to_bytes()).await?;
        writer.flush().await
    }
}

/// Whether a response to `method` with `status` carries a message body.
pub fn status_allows_body(method: &Method, status: StatusCode) -> bool {
    !(method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

fn write_headers(out: &mut Vec<u8>, headers: &Headers) {
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
