//! Reading HTTP/1.x messages from async byte streams.
//!
//! The head (start line plus header block) is accumulated under a byte budget
//! so a hostile peer cannot grow memory without bound, then tokenized with
//! `httparse`. Body framing follows the usual precedence: chunked transfer
//! coding, then Content-Length, then (responses only) read-until-EOF.

use super::error::ParseError;
use super::headers::Headers;
use super::message::{Request, Response, Version, status_allows_body};
use bytes::Bytes;
use http::{Method, StatusCode};
use httparse::{ParserConfig, Status};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Maximum length of a single chunk-size or trailer line.
const MAX_CHUNK_LINE: usize = 4096;

/// Size limits applied while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum bytes for the start line plus header block.
    pub max_header_bytes: usize,
    /// Maximum bytes for a decoded body.
    pub max_body_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_header_bytes: 64 * 1024,
            max_body_bytes: 64 * 1024 * 1024,
        }
    }
}

/// How the body of a message is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// No body.
    Empty,
    /// Exactly this many bytes.
    Length(u64),
    /// Chunked transfer coding.
    Chunked,
    /// Everything until the peer closes.
    UntilEof,
}

/// Read a request line and header block.
///
/// Returns `Ok(None)` when the peer closed the connection before sending
/// anything. The body is left unread; see [`read_request_body`].
pub async fn read_request_head<R>(
    reader: &mut R,
    limits: &Limits,
) -> Result<Option<Request>, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let Some(head) = read_head(reader, limits.max_header_bytes).await? else {
        return Ok(None);
    };
    parse_request_head(&head).map(Some)
}

/// Read the body of a request whose head was returned by [`read_request_head`].
pub async fn read_request_body<R>(
    reader: &mut R,
    request: &Request,
    limits: &Limits,
) -> Result<Bytes, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let kind = request_body_kind(&request.headers)?;
    read_body(reader, kind, limits).await
}

/// Read a complete request, head and body.
pub async fn read_request<R>(reader: &mut R, limits: &Limits) -> Result<Option<Request>, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let Some(request) = read_request_head(reader, limits).await? else {
        return Ok(None);
    };
    let body = read_request_body(reader, &request, limits).await?;
    Ok(Some(Request { body, ..request }))
}

/// Read a complete response to a request made with `request_method`.
///
/// Interim `1xx` responses (other than `101`) are skipped.
pub async fn read_response<R>(
    reader: &mut R,
    request_method: &Method,
    limits: &Limits,
) -> Result<Response, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let head = read_head(reader, limits.max_header_bytes)
            .await?
            .ok_or(ParseError::Truncated)?;
        let mut response = parse_response_head(&head)?;

        if response.status.is_informational() && response.status != StatusCode::SWITCHING_PROTOCOLS
        {
            continue;
        }

        let kind = response_body_kind(request_method, response.status, &response.headers)?;
        response.body = read_body(reader, kind, limits).await?;
        return Ok(response);
    }
}

fn parse_request_head(head: &[u8]) -> Result<Request, ParseError> {
    let mut slots = vec![httparse::EMPTY_HEADER; header_slots(head)];
    let mut parsed = httparse::Request::new(&mut slots);
    match parsed.parse(head) {
        Ok(Status::Complete(_)) => {}
        Ok(Status::Partial) => return Err(ParseError::Truncated),
        Err(e) => return Err(head_error(e, head)),
    }

    let malformed = || ParseError::MalformedStartLine(start_line(head));
    let method = parsed
        .method
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or_else(malformed)?;
    let target = parsed.path.ok_or_else(malformed)?.to_string();
    let version = parsed
        .version
        .and_then(Version::from_minor)
        .ok_or_else(malformed)?;

    Ok(Request {
        method,
        target,
        version,
        headers: collect_headers(parsed.headers),
        body: Bytes::new(),
    })
}

fn parse_response_head(head: &[u8]) -> Result<Response, ParseError> {
    let mut slots = vec![httparse::EMPTY_HEADER; header_slots(head)];
    let mut parsed = httparse::Response::new(&mut slots);
    let result = ParserConfig::default()
        .allow_obsolete_multiline_headers_in_responses(true)
        .parse_response(&mut parsed, head);
    match result {
        Ok(Status::Complete(_)) => {}
        Ok(Status::Partial) => return Err(ParseError::Truncated),
        Err(e) => return Err(head_error(e, head)),
    }

    let malformed = || ParseError::MalformedStartLine(start_line(head));
    let version = parsed
        .version
        .and_then(Version::from_minor)
        .ok_or_else(malformed)?;
    let status = parsed
        .code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(malformed)?;

    Ok(Response {
        version,
        status,
        reason: parsed.reason.unwrap_or_default().to_string(),
        headers: collect_headers(parsed.headers),
        body: Bytes::new(),
    })
}

/// Upper bound on the header count: one per line of the head.
fn header_slots(head: &[u8]) -> usize {
    head.iter().filter(|&&b| b == b'\n').count()
}

fn collect_headers(fields: &[httparse::Header<'_>]) -> Headers {
    fields
        .iter()
        .map(|field| {
            let value = String::from_utf8_lossy(field.value);
            // Folded continuation lines are joined with a single space.
            let value = if value.contains('\n') {
                value
                    .split('\n')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ")
            } else {
                value.trim().to_string()
            };
            (field.name.to_string(), value)
        })
        .collect()
}

fn head_error(error: httparse::Error, head: &[u8]) -> ParseError {
    match error {
        httparse::Error::HeaderName | httparse::Error::HeaderValue => {
            ParseError::MalformedHeader(error.to_string())
        }
        _ => ParseError::MalformedStartLine(start_line(head)),
    }
}

fn start_line(head: &[u8]) -> String {
    let end = head.iter().position(|&b| b == b'\n').unwrap_or(head.len());
    trim_line(&head[..end])
}

/// Body framing for a request.
pub fn request_body_kind(headers: &Headers) -> Result<BodyKind, ParseError> {
    if let Some(coding) = transfer_coding(headers) {
        if coding.eq_ignore_ascii_case("chunked") {
            return Ok(BodyKind::Chunked);
        }
        return Err(ParseError::UnsupportedTransferEncoding(coding));
    }
    match content_length(headers)? {
        Some(0) | None => Ok(BodyKind::Empty),
        Some(n) => Ok(BodyKind::Length(n)),
    }
}

/// Body framing for a response.
pub fn response_body_kind(
    request_method: &Method,
    status: StatusCode,
    headers: &Headers,
) -> Result<BodyKind, ParseError> {
    if !status_allows_body(request_method, status) {
        return Ok(BodyKind::Empty);
    }
    if let Some(coding) = transfer_coding(headers) {
        if coding.eq_ignore_ascii_case("chunked") {
            return Ok(BodyKind::Chunked);
        }
        return Ok(BodyKind::UntilEof);
    }
    match content_length(headers)? {
        Some(0) => Ok(BodyKind::Empty),
        Some(n) => Ok(BodyKind::Length(n)),
        None => Ok(BodyKind::UntilEof),
    }
}

/// Read a body delimited as `kind`.
pub async fn read_body<R>(reader: &mut R, kind: BodyKind, limits: &Limits) -> Result<Bytes, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let max = limits.max_body_bytes;
    match kind {
        BodyKind::Empty => Ok(Bytes::new()),
        BodyKind::Length(n) => {
            if n > max as u64 {
                return Err(ParseError::BodyTooLarge { limit: max });
            }
            let mut buf = vec![0u8; n as usize];
            reader.read_exact(&mut buf).await.map_err(eof_as_truncated)?;
            Ok(Bytes::from(buf))
        }
        BodyKind::Chunked => read_chunked(reader, limits).await,
        BodyKind::UntilEof => {
            let mut buf = Vec::new();
            (&mut *reader)
                .take(max as u64 + 1)
                .read_to_end(&mut buf)
                .await?;
            if buf.len() > max {
                return Err(ParseError::BodyTooLarge { limit: max });
            }
            Ok(Bytes::from(buf))
        }
    }
}

async fn read_chunked<R>(reader: &mut R, limits: &Limits) -> Result<Bytes, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let max = limits.max_body_bytes;
    let mut body = Vec::new();

    loop {
        let line = read_raw_line(reader, MAX_CHUNK_LINE).await?;
        let size = chunk_size(&line)?;

        if size == 0 {
            // Trailers are read and discarded.
            let mut trailer_bytes = 0usize;
            loop {
                let trailer = read_line(reader, MAX_CHUNK_LINE).await?;
                if trailer.is_empty() {
                    break;
                }
                trailer_bytes += trailer.len();
                if trailer_bytes > limits.max_header_bytes {
                    return Err(ParseError::HeadersTooLarge {
                        limit: limits.max_header_bytes,
                    });
                }
            }
            return Ok(Bytes::from(body));
        }

        // body.len() never exceeds max, so the remaining room cannot underflow.
        if size > (max - body.len()) as u64 {
            return Err(ParseError::BodyTooLarge { limit: max });
        }

        let start = body.len();
        body.resize(start + size as usize, 0);
        reader
            .read_exact(&mut body[start..])
            .await
            .map_err(eof_as_truncated)?;

        let terminator = read_line(reader, MAX_CHUNK_LINE).await?;
        if !terminator.is_empty() {
            return Err(ParseError::InvalidChunk(format!(
                "missing CRLF after {} byte chunk",
                size
            )));
        }
    }
}

/// Decode a chunk-size line, extensions ignored.
fn chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let invalid = || ParseError::InvalidChunk(trim_line(line));
    if !line.first().is_some_and(u8::is_ascii_hexdigit) {
        return Err(invalid());
    }
    match httparse::parse_chunk_size(line) {
        Ok(Status::Complete((_, size))) => Ok(size),
        Ok(Status::Partial) | Err(_) => Err(invalid()),
    }
}

/// Read one line of at most `max` bytes, terminator included.
async fn read_raw_line<R>(reader: &mut R, max: usize) -> Result<Vec<u8>, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(max as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 || !buf.ends_with(b"\n") {
        if buf.len() > max {
            return Err(ParseError::InvalidChunk("line too long".into()));
        }
        return Err(ParseError::Truncated);
    }
    Ok(buf)
}

/// Read one line of at most `max` bytes, without its line terminator.
async fn read_line<R>(reader: &mut R, max: usize) -> Result<String, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    read_raw_line(reader, max).await.map(|buf| trim_line(&buf))
}

/// Read raw bytes up to and including the blank line that ends a message head.
///
/// Leading blank lines before the start line are dropped but still count
/// against the budget.
async fn read_head<R>(reader: &mut R, max: usize) -> Result<Option<Vec<u8>>, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let mut consumed = 0usize;
    let mut head: Vec<u8> = Vec::new();

    loop {
        let line_start = head.len();
        let budget = (max + 1).saturating_sub(consumed) as u64;
        let n = (&mut *reader)
            .take(budget)
            .read_until(b'\n', &mut head)
            .await?;
        consumed += n;

        if consumed > max {
            return Err(ParseError::HeadersTooLarge { limit: max });
        }
        if n == 0 {
            if consumed == 0 {
                return Ok(None);
            }
            return Err(ParseError::Truncated);
        }
        if !head.ends_with(b"\n") {
            return Err(ParseError::Truncated);
        }

        if trim_line(&head[line_start..]).is_empty() {
            if line_start == 0 {
                head.clear();
                continue;
            }
            return Ok(Some(head));
        }
    }
}

fn content_length(headers: &Headers) -> Result<Option<u64>, ParseError> {
    let mut length = None;
    for value in headers.get_all("content-length").flat_map(|v| v.split(',')) {
        let value = value.trim();
        let parsed = value
            .parse::<u64>()
            .map_err(|_| ParseError::InvalidContentLength(value.to_string()))?;
        match length {
            Some(existing) if existing != parsed => {
                return Err(ParseError::InvalidContentLength(format!(
                    "conflicting values {} and {}",
                    existing, parsed
                )));
            }
            _ => length = Some(parsed),
        }
    }
    Ok(length)
}

/// The final transfer coding, if any.
fn transfer_coding(headers: &Headers) -> Option<String> {
    headers
        .get_all("transfer-encoding")
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .last()
        .map(str::to_string)
}

fn trim_line(buf: &[u8]) -> String {
    let line = buf.strip_suffix(b"\n").unwrap_or(buf);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

fn eof_as_truncated(err: std::io::Error) -> ParseError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ParseError::Truncated
    } else {
        ParseError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse_request(raw: &[u8]) -> Result<Option<Request>, ParseError> {
        let mut reader = raw;
        read_request(&mut reader, &Limits::default()).await
    }

    async fn parse_response(raw: &[u8], method: Method) -> Result<Response, ParseError> {
        let mut reader = raw;
        read_response(&mut reader, &method, &Limits::default()).await
    }

    #[tokio::test]
    async fn test_parse_simple_request() {
        let raw = b"GET http://example.com/a.txt HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n";
        let request = parse_request(raw).await.unwrap().unwrap();

        assert_eq!(request.method, Method::GET);
        assert_eq!(request.target, "http://example.com/a.txt");
        assert_eq!(request.version, Version::Http11);
        assert_eq!(request.headers.get("HOST"), Some("example.com"));
        assert!(request.body.is_empty());
    }

    #[tokio::test]
    async fn test_round_trip_preserves_wire_form() {
        let raw = b"POST http://example.com/form HTTP/1.1\r\n\
X-Zebra: 1\r\n\
host: example.com\r\n\
Content-Type: text/plain\r\n\
X-Alpha: 2\r\n\
Content-Length: 11\r\n\
\r\n\
hello world";
        let request = parse_request(raw).await.unwrap().unwrap();
        assert_eq!(request.to_bytes(), raw.to_vec());
    }

    #[tokio::test]
    async fn test_round_trip_response() {
        let raw = b"HTTP/1.1 404 Not Found\r\nServer: test\r\nContent-Length: 4\r\nx-lower: yes\r\n\r\nnope";
        let response = parse_response(raw, Method::GET).await.unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(response.reason, "Not Found");
        assert_eq!(response.to_bytes(), raw.to_vec());
    }

    #[tokio::test]
    async fn test_empty_stream_is_none() {
        assert!(parse_request(b"").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_leading_blank_lines_skipped() {
        let raw = b"\r\n\r\nGET / HTTP/1.1\r\nHost: a\r\n\r\n";
        let request = parse_request(raw).await.unwrap().unwrap();
        assert_eq!(request.target, "/");
    }

    #[tokio::test]
    async fn test_malformed_start_lines() {
        for raw in [
            &b"GET /\r\n\r\n"[..],
            b"GET  / HTTP/1.1\r\n\r\n",
            b"GET / HTTP/2.0\r\n\r\n",
            b"G{T / HTTP/1.1\r\n\r\n",
            b"GET / HTTP/1.1 extra\r\n\r\n",
        ] {
            let err = parse_request(raw).await.unwrap_err();
            assert!(
                matches!(err, ParseError::MalformedStartLine(_)),
                "unexpected {:?} for {:?}",
                err,
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[tokio::test]
    async fn test_malformed_header() {
        let err = parse_request(b"GET / HTTP/1.1\r\nNoColonHere\r\n\r\n")
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::MalformedHeader(_)));

        let err = parse_request(b"GET / HTTP/1.1\r\nBad Name: x\r\n\r\n")
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::MalformedHeader(_)));
    }

    #[tokio::test]
    async fn test_truncated_head() {
        let err = parse_request(b"GET / HTTP/1.1\r\nHost: a\r\n").await.unwrap_err();
        assert!(matches!(err, ParseError::Truncated));
    }

    #[tokio::test]
    async fn test_truncated_body() {
        let err = parse_request(b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 10\r\n\r\nshort")
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::Truncated));
    }

    #[tokio::test]
    async fn test_header_limit() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        raw.extend_from_slice(format!("X-Big: {}\r\n\r\n", "a".repeat(200)).as_bytes());

        let limits = Limits {
            max_header_bytes: 100,
            max_body_bytes: 1024,
        };
        let mut reader = &raw[..];
        let err = read_request(&mut reader, &limits).await.unwrap_err();
        assert!(matches!(err, ParseError::HeadersTooLarge { limit: 100 }));
    }

    #[tokio::test]
    async fn test_endless_header_line_is_bounded() {
        let raw = vec![b'A'; 10_000];
        let limits = Limits {
            max_header_bytes: 512,
            max_body_bytes: 1024,
        };
        let mut reader = &raw[..];
        let err = read_request(&mut reader, &limits).await.unwrap_err();
        assert!(matches!(err, ParseError::HeadersTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_body_limit() {
        let raw = b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 2048\r\n\r\n";
        let limits = Limits {
            max_header_bytes: 1024,
            max_body_bytes: 1024,
        };
        let mut reader = &raw[..];
        let err = read_request(&mut reader, &limits).await.unwrap_err();
        assert!(matches!(err, ParseError::BodyTooLarge { limit: 1024 }));
    }

    #[tokio::test]
    async fn test_conflicting_content_length() {
        let err = parse_request(
            b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\nabcd",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ParseError::InvalidContentLength(_)));
    }

    #[tokio::test]
    async fn test_chunked_request_decoded() {
        let raw = b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n\
5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: ignored\r\n\r\n";
        let request = parse_request(raw).await.unwrap().unwrap();
        assert_eq!(&request.body[..], b"hello world");
    }

    #[tokio::test]
    async fn test_chunked_response_decoded() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nA\r\n0123456789\r\n0\r\n\r\n";
        let response = parse_response(raw, Method::GET).await.unwrap();
        assert_eq!(&response.body[..], b"0123456789");
    }

    #[tokio::test]
    async fn test_invalid_chunk_size() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\nabc\r\n0\r\n\r\n";
        let err = parse_response(raw, Method::GET).await.unwrap_err();
        assert!(matches!(err, ParseError::InvalidChunk(_)));
    }

    #[tokio::test]
    async fn test_unsupported_request_coding() {
        let err = parse_request(b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: gzip\r\n\r\n")
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedTransferEncoding(_)));
    }

    #[tokio::test]
    async fn test_response_body_until_eof() {
        let raw = b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\n\r\nall of the rest";
        let response = parse_response(raw, Method::GET).await.unwrap();
        assert_eq!(response.version, Version::Http10);
        assert_eq!(&response.body[..], b"all of the rest");
    }

    #[tokio::test]
    async fn test_head_response_has_no_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 500\r\n\r\n";
        let response = parse_response(raw, Method::HEAD).await.unwrap();
        assert!(response.body.is_empty());
        assert_eq!(response.headers.get("content-length"), Some("500"));
    }

    #[tokio::test]
    async fn test_not_modified_has_no_body() {
        let raw = b"HTTP/1.1 304 Not Modified\r\nETag: \"v1\"\r\n\r\n";
        let response = parse_response(raw, Method::GET).await.unwrap();
        assert_eq!(response.status, StatusCode::NOT_MODIFIED);
        assert!(response.body.is_empty());
    }

    #[tokio::test]
    async fn test_interim_response_skipped() {
        let raw = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok";
        let response = parse_response(raw, Method::POST).await.unwrap();
        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(&response.body[..], b"ok");
    }

    #[tokio::test]
    async fn test_status_line_without_reason() {
        let raw = b"HTTP/1.1 204\r\n\r\n";
        let response = parse_response(raw, Method::GET).await.unwrap();
        assert_eq!(response.status, StatusCode::NO_CONTENT);
        assert_eq!(response.reason, "");
    }

    #[tokio::test]
    async fn test_malformed_status_line() {
        let err = parse_response(b"HTTP/1.1 abc OK\r\n\r\n", Method::GET)
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::MalformedStartLine(_)));
    }

    #[tokio::test]
    async fn test_folded_header_rejected_in_request() {
        let raw = b"GET / HTTP/1.1\r\nHost: a\r\nX-Long: first\r\n  second\r\n\r\n";
        let err = parse_request(raw).await.unwrap_err();
        assert!(matches!(err, ParseError::MalformedHeader(_)));
    }

    #[tokio::test]
    async fn test_folded_header_joined_in_response() {
        let raw = b"HTTP/1.1 200 OK\r\nX-Long: first\r\n  second\r\nContent-Length: 0\r\n\r\n";
        let response = parse_response(raw, Method::GET).await.unwrap();
        assert_eq!(response.headers.get("x-long"), Some("first second"));
        assert_eq!(response.headers.get("content-length"), Some("0"));
    }

    #[tokio::test]
    async fn test_huge_chunk_size_after_data_is_rejected() {
        let raw = b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n\
5\r\nhello\r\nFFFFFFFFFFFFFFFF\r\nabc\r\n0\r\n\r\n";
        let err = parse_request(raw).await.unwrap_err();
        assert!(matches!(err, ParseError::InvalidChunk(_)), "got {:?}", err);
        assert!(err.is_protocol_error());
    }

    #[tokio::test]
    async fn test_chunk_over_remaining_budget() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
5\r\nhello\r\nFFFFFFFFFFFFFFF\r\nabc\r\n0\r\n\r\n";
        let limits = Limits {
            max_header_bytes: 1024,
            max_body_bytes: 1024,
        };
        let mut reader = &raw[..];
        let err = read_response(&mut reader, &Method::GET, &limits)
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::BodyTooLarge { limit: 1024 }));

        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
3FC\r\n";
        let mut body = raw.to_vec();
        body.extend_from_slice(&[b'x'; 0x3FC]);
        body.extend_from_slice(b"\r\n5\r\nhello\r\n0\r\n\r\n");
        let mut reader = &body[..];
        let err = read_response(&mut reader, &Method::GET, &limits)
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::BodyTooLarge { limit: 1024 }));
    }

    #[tokio::test]
    async fn test_empty_chunk_size_line() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\r\nabc\r\n0\r\n\r\n";
        let err = parse_response(raw, Method::GET).await.unwrap_err();
        assert!(matches!(err, ParseError::InvalidChunk(_)));
    }

    #[tokio::test]
    async fn test_many_headers_parsed_in_order() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..300 {
            raw.extend_from_slice(format!("X-H{}: {}\r\n", i, i).as_bytes());
        }
        raw.extend_from_slice(b"\r\n");
        let request = parse_request(&raw).await.unwrap().unwrap();
        assert_eq!(request.headers.len(), 300);
        assert_eq!(request.headers.iter().last(), Some(("X-H299", "299")));
    }

    #[tokio::test]
    async fn test_head_then_body_leaves_following_bytes() {
        let raw = b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 3\r\n\r\nabcNEXT";
        let mut reader = &raw[..];
        let limits = Limits::default();

        let head = read_request_head(&mut reader, &limits).await.unwrap().unwrap();
        let body = read_request_body(&mut reader, &head, &limits).await.unwrap();
        assert_eq!(&body[..], b"abc");
        assert_eq!(reader, b"NEXT");
    }
}
