//! Shared response cache.
//!
//! Responses are keyed by method plus normalized absolute URL and held in a
//! bounded in-memory LRU. Freshness follows `Cache-Control` and `Expires`;
//! stale entries with validators are revalidated by the response pipeline
//! rather than served.

mod freshness;
mod store;

pub use freshness::{
    CacheControl, Validators, freshness_lifetime, is_cacheable, parse_http_date,
    request_bypasses_cache,
};
pub use store::{CacheEntry, CacheKey, CacheLimits, CacheStats, CacheStore};
