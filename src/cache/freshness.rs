//! Cacheability and freshness rules.
//!
//! The proxy acts as a shared cache, so `private` responses are never stored
//! and `s-maxage` takes precedence over `max-age`.

use crate::http::{Headers, Request, Response};
use chrono::{DateTime, Utc};
use http::{Method, StatusCode};
use std::time::Duration;

/// Statuses stored without explicit freshness information.
const CACHEABLE_BY_DEFAULT: [StatusCode; 4] = [
    StatusCode::OK,
    StatusCode::MOVED_PERMANENTLY,
    StatusCode::FOUND,
    StatusCode::NOT_FOUND,
];

/// Parsed `Cache-Control` directives relevant to a shared cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    /// `no-store`
    pub no_store: bool,
    /// `no-cache`: may be stored but must be revalidated before use.
    pub no_cache: bool,
    /// `private`
    pub private: bool,
    /// `public`
    pub public: bool,
    /// `max-age=N`
    pub max_age: Option<u64>,
    /// `s-maxage=N`
    pub s_maxage: Option<u64>,
}

impl CacheControl {
    /// Parse every `Cache-Control` field in `headers`.
    ///
    /// Unknown directives are ignored, as are numeric directives whose value
    /// does not parse.
    pub fn parse(headers: &Headers) -> Self {
        let mut cc = Self::default();
        for directive in headers.get_all("cache-control").flat_map(|v| v.split(',')) {
            let (name, value) = match directive.split_once('=') {
                Some((n, v)) => (n.trim(), Some(v.trim().trim_matches('"'))),
                None => (directive.trim(), None),
            };
            let seconds = || value.and_then(|v| v.parse::<u64>().ok());

            match name.to_ascii_lowercase().as_str() {
                "no-store" => cc.no_store = true,
                "no-cache" => cc.no_cache = true,
                "private" => cc.private = true,
                "public" => cc.public = true,
                "max-age" => cc.max_age = cc.max_age.or_else(seconds),
                "s-maxage" => cc.s_maxage = cc.s_maxage.or_else(seconds),
                _ => {}
            }
        }
        cc
    }
}

/// Stored validators used to build a conditional request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    /// `ETag` value, quotes included.
    pub etag: Option<String>,
    /// `Last-Modified` value.
    pub last_modified: Option<String>,
}

impl Validators {
    /// Extract validators from response headers.
    pub fn from_headers(headers: &Headers) -> Self {
        Self {
            etag: headers.get("etag").map(str::to_string),
            last_modified: headers.get("last-modified").map(str::to_string),
        }
    }

    /// Whether there is nothing to revalidate with.
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }

    /// Add `If-None-Match` / `If-Modified-Since` to an outgoing request.
    pub fn apply_to(&self, headers: &mut Headers) {
        if let Some(etag) = &self.etag {
            headers.set("If-None-Match", etag.as_str());
        }
        if let Some(last_modified) = &self.last_modified {
            headers.set("If-Modified-Since", last_modified.as_str());
        }
    }
}

/// Whether `request` must skip the cache entirely.
pub fn request_bypasses_cache(request: &Request) -> bool {
    if request.method != Method::GET && request.method != Method::HEAD {
        return true;
    }
    CacheControl::parse(&request.headers).no_store || request.headers.contains("authorization")
}

/// Whether `response` may be stored by a shared cache.
pub fn is_cacheable(response: &Response) -> bool {
    let cc = CacheControl::parse(&response.headers);
    if cc.no_store || cc.private {
        return false;
    }
    if response.status.is_informational()
        || response.status == StatusCode::NOT_MODIFIED
        || response.status == StatusCode::PARTIAL_CONTENT
    {
        return false;
    }

    CACHEABLE_BY_DEFAULT.contains(&response.status) || is_explicitly_cacheable(response, &cc)
}

fn is_explicitly_cacheable(response: &Response, cc: &CacheControl) -> bool {
    cc.public || cc.max_age.is_some() || cc.s_maxage.is_some() || response.headers.contains("expires")
}

/// How long `response` stays fresh after it was received.
///
/// Precedence: `s-maxage`, `max-age`, `Expires` minus `Date` (or minus now
/// when `Date` is absent), then `default_ttl`. `no-cache` and unparseable
/// `Expires` values yield zero so the entry is revalidated on next use.
pub fn freshness_lifetime(response: &Response, default_ttl: Duration) -> Duration {
    let cc = CacheControl::parse(&response.headers);
    if cc.no_cache {
        return Duration::ZERO;
    }
    if let Some(secs) = cc.s_maxage.or(cc.max_age) {
        return Duration::from_secs(secs);
    }

    if let Some(expires) = response.headers.get("expires") {
        let Some(expires) = parse_http_date(expires) else {
            return Duration::ZERO;
        };
        let base = response
            .headers
            .get("date")
            .and_then(parse_http_date)
            .unwrap_or_else(Utc::now);
        return (expires - base).to_std().unwrap_or(Duration::ZERO);
    }

    default_ttl
}

/// Parse an IMF-fixdate such as `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: StatusCode, headers: &[(&str, &str)]) -> Response {
        let mut response = Response::new(status);
        for (name, value) in headers {
            response.headers.append(*name, *value);
        }
        response
    }

    #[test]
    fn test_parse_cache_control() {
        let headers: Headers = [
            ("Cache-Control", "public, max-age=60"),
            ("cache-control", "s-maxage=\"120\", must-revalidate"),
        ]
        .into_iter()
        .collect();
        let cc = CacheControl::parse(&headers);

        assert!(cc.public);
        assert_eq!(cc.max_age, Some(60));
        assert_eq!(cc.s_maxage, Some(120));
        assert!(!cc.no_store);
    }

    #[test]
    fn test_bad_max_age_ignored() {
        let headers: Headers = [("Cache-Control", "max-age=soon")].into_iter().collect();
        assert_eq!(CacheControl::parse(&headers).max_age, None);
    }

    #[test]
    fn test_default_cacheable_statuses() {
        for status in CACHEABLE_BY_DEFAULT {
            assert!(is_cacheable(&response(status, &[])), "{}", status);
        }
        assert!(!is_cacheable(&response(StatusCode::INTERNAL_SERVER_ERROR, &[])));
        assert!(!is_cacheable(&response(StatusCode::CREATED, &[])));
    }

    #[test]
    fn test_explicitly_cacheable_status() {
        let r = response(StatusCode::GONE, &[("Cache-Control", "max-age=30")]);
        assert!(is_cacheable(&r));

        let r = response(
            StatusCode::NO_CONTENT,
            &[("Expires", "Thu, 01 Jan 2099 00:00:00 GMT")],
        );
        assert!(is_cacheable(&r));
    }

    #[test]
    fn test_no_store_and_private_never_cached() {
        assert!(!is_cacheable(&response(
            StatusCode::OK,
            &[("Cache-Control", "no-store")]
        )));
        assert!(!is_cacheable(&response(
            StatusCode::OK,
            &[("Cache-Control", "private, max-age=60")]
        )));
    }

    #[test]
    fn test_not_modified_not_cacheable() {
        assert!(!is_cacheable(&response(
            StatusCode::NOT_MODIFIED,
            &[("Cache-Control", "max-age=60")]
        )));
    }

    #[test]
    fn test_lifetime_precedence() {
        let default = Duration::from_secs(300);

        let r = response(StatusCode::OK, &[("Cache-Control", "max-age=60, s-maxage=10")]);
        assert_eq!(freshness_lifetime(&r, default), Duration::from_secs(10));

        let r = response(
            StatusCode::OK,
            &[
                ("Cache-Control", "max-age=60"),
                ("Expires", "Thu, 01 Jan 2099 00:00:00 GMT"),
            ],
        );
        assert_eq!(freshness_lifetime(&r, default), Duration::from_secs(60));

        let r = response(StatusCode::OK, &[]);
        assert_eq!(freshness_lifetime(&r, default), default);
    }

    #[test]
    fn test_lifetime_from_expires_minus_date() {
        let r = response(
            StatusCode::OK,
            &[
                ("Date", "Sun, 06 Nov 1994 08:49:37 GMT"),
                ("Expires", "Sun, 06 Nov 1994 08:59:37 GMT"),
            ],
        );
        assert_eq!(
            freshness_lifetime(&r, Duration::from_secs(300)),
            Duration::from_secs(600)
        );
    }

    #[test]
    fn test_expires_in_past_or_invalid_is_stale() {
        let default = Duration::from_secs(300);

        let r = response(
            StatusCode::OK,
            &[
                ("Date", "Sun, 06 Nov 1994 08:49:37 GMT"),
                ("Expires", "Sun, 06 Nov 1994 08:00:00 GMT"),
            ],
        );
        assert_eq!(freshness_lifetime(&r, default), Duration::ZERO);

        let r = response(StatusCode::OK, &[("Expires", "0")]);
        assert_eq!(freshness_lifetime(&r, default), Duration::ZERO);
    }

    #[test]
    fn test_no_cache_has_zero_lifetime() {
        let r = response(StatusCode::OK, &[("Cache-Control", "no-cache, max-age=600")]);
        assert_eq!(freshness_lifetime(&r, Duration::from_secs(300)), Duration::ZERO);
    }

    #[test]
    fn test_validators() {
        let headers: Headers = [
            ("ETag", "\"abc\""),
            ("Last-Modified", "Sun, 06 Nov 1994 08:49:37 GMT"),
        ]
        .into_iter()
        .collect();
        let validators = Validators::from_headers(&headers);
        assert!(!validators.is_empty());

        let mut outgoing = Headers::new();
        validators.apply_to(&mut outgoing);
        assert_eq!(outgoing.get("if-none-match"), Some("\"abc\""));
        assert_eq!(
            outgoing.get("if-modified-since"),
            Some("Sun, 06 Nov 1994 08:49:37 GMT")
        );

        assert!(Validators::from_headers(&Headers::new()).is_empty());
    }

    #[test]
    fn test_request_bypass() {
        let get = Request::new(Method::GET, "http://example.com/");
        assert!(!request_bypasses_cache(&get));

        let post = Request::new(Method::POST, "http://example.com/");
        assert!(request_bypasses_cache(&post));

        let mut no_store = Request::new(Method::GET, "http://example.com/");
        no_store.headers.append("Cache-Control", "no-store");
        assert!(request_bypasses_cache(&no_store));

        let mut auth = Request::new(Method::HEAD, "http://example.com/");
        auth.headers.append("Authorization", "Basic Zm9vOmJhcg==");
        assert!(request_bypasses_cache(&auth));
    }
}
