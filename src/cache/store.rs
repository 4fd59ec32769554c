//! In-memory LRU response store.

use super::freshness::{Validators, freshness_lifetime, is_cacheable};
use crate::http::{Response, Target};
use http::Method;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

/// Identity of a cached response: method plus normalized absolute URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Request method, `GET` or `HEAD`.
    pub method: Method,
    /// Normalized absolute URL (lowercase scheme and host, default port elided).
    pub url: String,
}

impl CacheKey {
    /// Build the key for a request to `target`.
    pub fn new(method: &Method, target: &Target) -> Self {
        Self {
            method: method.clone(),
            url: target.absolute_url(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A stored response and its freshness metadata.
///
/// Entries are immutable; revalidation produces a new entry that replaces the
/// old one.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Response as it will be replayed to clients.
    pub response: Response,
    /// Wall-clock time the entry was stored.
    pub inserted_at: SystemTime,
    /// Monotonic freshness deadline.
    pub fresh_until: Instant,
    /// Validators for conditional revalidation.
    pub validators: Validators,
    /// How long the upstream fetch took.
    pub fetch_duration: Duration,
}

impl CacheEntry {
    /// Create an entry that stays fresh for `lifetime` from now.
    pub fn new(response: Response, lifetime: Duration, fetch_duration: Duration) -> Self {
        let validators = Validators::from_headers(&response.headers);
        Self {
            response,
            inserted_at: SystemTime::now(),
            fresh_until: deadline_after(lifetime),
            validators,
            fetch_duration,
        }
    }

    /// Whether the entry may be served without contacting the origin.
    pub fn is_fresh(&self) -> bool {
        Instant::now() < self.fresh_until
    }

    /// The entry after a `304 Not Modified`.
    ///
    /// Keeps the stored body and merges the metadata fields the 304 carried.
    /// The new lifetime is computed from the merged headers.
    pub fn refreshed(&self, not_modified: &Response, default_ttl: Duration) -> Self {
        let mut response = self.response.clone();
        for name in ["cache-control", "date", "etag", "expires", "last-modified"] {
            if let Some(value) = not_modified.headers.get(name) {
                response.headers.set(name, value);
            }
        }
        let validators = Validators::from_headers(&response.headers);
        let lifetime = freshness_lifetime(&response, default_ttl);

        Self {
            response,
            inserted_at: SystemTime::now(),
            fresh_until: deadline_after(lifetime),
            validators,
            fetch_duration: self.fetch_duration,
        }
    }

    /// Approximate memory held by the entry.
    pub fn size(&self) -> usize {
        let headers: usize = self
            .response
            .headers
            .iter()
            .map(|(n, v)| n.len() + v.len() + 4)
            .sum();
        self.response.body.len() + headers + self.response.reason.len()
    }

    /// Whether the stored response is internally consistent.
    fn is_consistent(&self, method: &Method) -> bool {
        if !is_cacheable(&self.response) {
            return false;
        }
        if *method == Method::HEAD {
            return true;
        }
        match self.response.headers.get("content-length") {
            Some(len) => len.trim().parse::<usize>().ok() == Some(self.response.body.len()),
            None => true,
        }
    }
}

fn deadline_after(lifetime: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(lifetime).unwrap_or(now)
}

/// Capacity limits for a [`CacheStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    /// Maximum number of entries.
    pub max_entries: usize,
    /// Maximum total size of all entries.
    pub max_bytes: usize,
    /// Entries larger than this are never stored.
    pub max_entry_bytes: usize,
    /// Lifetime for responses without explicit freshness information.
    pub default_ttl: Duration,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_entries: 1024,
            max_bytes: 64 * 1024 * 1024,
            max_entry_bytes: 8 * 1024 * 1024,
            default_ttl: Duration::from_secs(300),
        }
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Entries currently stored.
    pub entries: usize,
    /// Bytes currently held.
    pub bytes: usize,
    /// Lookups that found a fresh entry.
    pub hits: u64,
    /// Lookups that found an expired entry, later revalidated or refetched.
    pub stale: u64,
    /// Lookups that found nothing (or a corrupt entry).
    pub misses: u64,
    /// Successful insertions.
    pub insertions: u64,
    /// Entries dropped to stay within capacity.
    pub evictions: u64,
}

struct Inner {
    lru: LruCache<CacheKey, Arc<CacheEntry>>,
    bytes_in_use: usize,
}

/// Thread-safe LRU store of cached responses.
///
/// Lookups hand out `Arc` clones so readers never observe a partially
/// replaced entry.
pub struct CacheStore {
    inner: Mutex<Inner>,
    limits: CacheLimits,
    hits: AtomicU64,
    stale: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStore {
    /// Create an empty store.
    pub fn new(limits: CacheLimits) -> Self {
        let capacity = NonZeroUsize::new(limits.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                lru: LruCache::new(capacity),
                bytes_in_use: 0,
            }),
            limits,
            hits: AtomicU64::new(0),
            stale: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            insertions: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Configured limits.
    pub fn limits(&self) -> &CacheLimits {
        &self.limits
    }

    /// Look up `key`, marking it most recently used.
    ///
    /// Fresh and stale entries are both returned; the caller decides whether
    /// to revalidate. Corrupt entries are dropped and reported as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let mut inner = self.inner.lock();
        let entry = inner.lru.get(key).cloned();

        match entry {
            Some(entry) if entry.is_consistent(&key.method) => {
                let counter = if entry.is_fresh() { &self.hits } else { &self.stale };
                counter.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            Some(entry) => {
                warn!("Dropping corrupt cache entry for {}", key);
                inner.lru.pop(key);
                inner.bytes_in_use = inner.bytes_in_use.saturating_sub(entry.size());
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store `entry` under `key`, replacing any previous entry.
    ///
    /// Returns `false` if the entry is too large to store, in which case any
    /// previous entry for the key is removed as well.
    pub fn put(&self, key: CacheKey, entry: CacheEntry) -> bool {
        let size = entry.size();
        if size > self.limits.max_entry_bytes || size > self.limits.max_bytes {
            debug!("Not caching {}: {} bytes exceeds entry limit", key, size);
            self.remove(&key);
            return false;
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        inner.bytes_in_use += size;
        if let Some((pushed_out_key, removed)) = inner.lru.push(key.clone(), Arc::new(entry)) {
            inner.bytes_in_use = inner.bytes_in_use.saturating_sub(removed.size());
            if pushed_out_key != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        while inner.bytes_in_use > self.limits.max_bytes {
            match inner.lru.pop_lru() {
                Some((evicted_key, removed)) => {
                    debug!("Evicted {} from cache", evicted_key);
                    inner.bytes_in_use = inner.bytes_in_use.saturating_sub(removed.size());
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }

        self.insertions.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Remove the entry for `key`, returning whether one existed.
    pub fn remove(&self, key: &CacheKey) -> bool {
        let mut inner = self.inner.lock();
        match inner.lru.pop(key) {
            Some(removed) => {
                inner.bytes_in_use = inner.bytes_in_use.saturating_sub(removed.size());
                true
            }
            None => false,
        }
    }

    /// Drop every entry, returning how many were removed.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.lru.len();
        inner.lru.clear();
        inner.bytes_in_use = 0;
        count
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.inner.lock().lru.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total size of stored entries.
    pub fn bytes_in_use(&self) -> usize {
        self.inner.lock().bytes_in_use
    }

    /// Snapshot of counters and occupancy.
    pub fn stats(&self) -> CacheStats {
        let (entries, bytes) = {
            let inner = self.inner.lock();
            (inner.lru.len(), inner.bytes_in_use)
        };
        CacheStats {
            entries,
            bytes,
            hits: self.hits.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("limits", &self.limits)
            .field("stats", &self.stats())
            .finish()
    }
}
