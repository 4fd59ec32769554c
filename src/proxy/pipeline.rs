//! Response pipeline: cache lookup, revalidation and upstream fetch.
//!
//! For each allowed HTTP request the pipeline decides whether the response
//! can come from the cache, needs a conditional request, or must be fetched.
//!
//! ```text
//! request ──► bypass? ──yes──────────────────────────► fetch ──► client
//!               │no
//!               ▼
//!            lookup ──fresh──────────────────────────────────► client
//!               │stale + validators ──► conditional ──304──► refresh ──► client
//!               │stale, no validators ──► evict ─┐     └─other──► store ─► client
//!               │miss ◄─────────────────────────┘
//!               ▼
//!             fetch ──► store if cacheable ──► client
//! ```

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use tracing::{debug, info, warn};

use super::error::ProxyResult;
use super::upstream::UpstreamConnector;
use crate::cache::{
    CacheEntry, CacheKey, CacheStore, freshness_lifetime, is_cacheable, request_bypasses_cache,
};
use crate::http::{Request, Response, Target};
use crate::telemetry::{AuditEvent, AuditLogger, CacheStatus};

/// A response ready to be written to the client.
#[derive(Debug, Clone)]
pub struct Served {
    /// The response, already normalized for forwarding.
    pub response: Response,
    /// How the cache was involved.
    pub cache: CacheStatus,
}

/// Produces responses for allowed HTTP requests.
#[derive(Debug, Clone)]
pub struct ResponsePipeline {
    cache: Option<Arc<CacheStore>>,
    connector: Arc<UpstreamConnector>,
    audit: Arc<AuditLogger>,
}

impl ResponsePipeline {
    /// Create a pipeline. With `cache` set to `None` every request is fetched.
    pub fn new(
        cache: Option<Arc<CacheStore>>,
        connector: Arc<UpstreamConnector>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            cache,
            connector,
            audit,
        }
    }

    /// The cache store, if caching is enabled.
    pub fn cache(&self) -> Option<&Arc<CacheStore>> {
        self.cache.as_ref()
    }

    /// Produce the response for `request`, whose destination is `target`.
    ///
    /// Upstream failures are returned as errors; the caller turns them into
    /// 502/504 pages with [`ProxyError::status`](super::ProxyError::status).
    pub async fn handle(&self, request: &Request, target: &Target) -> ProxyResult<Served> {
        let outgoing = request.to_upstream(target);

        let cache = match &self.cache {
            Some(cache) if !request_bypasses_cache(request) => cache,
            _ => {
                let (response, _) = self.connector.send(target, &outgoing).await?;
                return Ok(Served {
                    response: response.into_forwardable(&request.method),
                    cache: CacheStatus::Bypass,
                });
            }
        };

        let key = CacheKey::new(&request.method, target);

        if let Some(entry) = cache.get(&key) {
            if entry.is_fresh() {
                info!(
                    "Saved {} ms by serving {} from cache",
                    entry.fetch_duration.as_millis(),
                    key
                );
                self.audit.log(AuditEvent::CacheHit {
                    url: key.url.clone(),
                    saved_ms: entry.fetch_duration.as_millis() as u64,
                });
                return Ok(Served {
                    response: entry.response.clone(),
                    cache: CacheStatus::Hit,
                });
            }

            if entry.validators.is_empty() {
                debug!("Cache entry for {} expired without validators", key);
                cache.remove(&key);
            } else {
                return self.revalidate(cache, key, &entry, request, target, outgoing).await;
            }
        }

        let (response, elapsed) = self.connector.send(target, &outgoing).await?;
        let response = response.into_forwardable(&request.method);
        self.store(cache, key, &response, elapsed);
        Ok(Served {
            response,
            cache: CacheStatus::Miss,
        })
    }

    /// Send a conditional request for a stale entry.
    async fn revalidate(
        &self,
        cache: &CacheStore,
        key: CacheKey,
        entry: &CacheEntry,
        request: &Request,
        target: &Target,
        mut conditional: Request,
    ) -> ProxyResult<Served> {
        entry.validators.apply_to(&mut conditional.headers);
        debug!("Revalidating {}", key);

        let (response, elapsed) = match self.connector.send(target, &conditional).await {
            Ok(exchange) => exchange,
            Err(e) => {
                warn!("Revalidation of {} failed, evicting: {}", key, e);
                cache.remove(&key);
                return Err(e);
            }
        };

        if response.status == StatusCode::NOT_MODIFIED {
            let refreshed = entry.refreshed(&response, cache.limits().default_ttl);
            let served = refreshed.response.clone();
            debug!("{} not modified, freshness extended", key);
            cache.put(key, refreshed);
            return Ok(Served {
                response: served,
                cache: CacheStatus::Revalidated,
            });
        }

        let response = response.into_forwardable(&request.method);
        self.store(cache, key, &response, elapsed);
        Ok(Served {
            response,
            cache: CacheStatus::Miss,
        })
    }

    /// Insert `response` if it is cacheable, otherwise drop any old entry.
    fn store(&self, cache: &CacheStore, key: CacheKey, response: &Response, elapsed: Duration) {
        if !is_cacheable(response) {
            cache.remove(&key);
            return;
        }
        let lifetime = freshness_lifetime(response, cache.limits().default_ttl);
        let entry = CacheEntry::new(response.clone(), lifetime, elapsed);
        if cache.put(key, entry) {
            debug!("Stored response, fresh for {:?}", lifetime);
        }
    }
}
