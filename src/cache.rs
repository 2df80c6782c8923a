//! Response micro-cache.
//!
//! A burst absorber, not a correctness cache: identical GETs that arrive
//! within a short TTL are answered from memory without touching the origin.
//! One instance per worker, handed to the [`Gateway`](crate::Gateway) at
//! construction. Nothing here awaits, so the lock is never held across a
//! suspension point.
//!
//! Bounds:
//! - an entry is never returned once `now > inserted_at + ttl`;
//! - the map never holds more than `max_entries`. When a store would exceed
//!   it, expired entries go first, then the oldest insertions. Eviction is
//!   not LRU.
//!
//! A poisoned lock is treated as an empty cache: lookups miss, stores are
//! dropped, and requests are proxied normally.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode, Uri};
use tokio::time::Instant;
use tracing::debug;

use crate::config::CacheConfig;
use crate::headers::HeaderList;

/// Method, full URL, and the `accept-encoding` the client asked with.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(method: &Method, uri: &Uri, accept_encoding: Option<&str>) -> Self {
        let target = uri.path_and_query().map_or("/", |pq| pq.as_str());
        let mut key = format!("{method} {target}");
        if let Some(encoding) = accept_encoding {
            key.push_str(" ae=");
            key.push_str(encoding);
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A complete upstream response, frozen at insertion.
#[derive(Debug)]
pub struct CacheEntry {
    pub status: StatusCode,
    /// Response headers after sanitizing and rewriting, duplicates joined.
    pub headers: HeaderList,
    pub body: Bytes,
    pub inserted_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn new(status: StatusCode, headers: HeaderList, body: Bytes, ttl: Duration) -> Self {
        Self { status, headers: headers.joined(), body, inserted_at: Instant::now(), ttl }
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        now <= self.inserted_at + self.ttl
    }

    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.inserted_at)
    }
}

pub struct MicroCache {
    entries: Mutex<HashMap<CacheKey, Arc<CacheEntry>>>,
    config: CacheConfig,
}

impl MicroCache {
    pub fn new(config: CacheConfig) -> Self {
        Self { entries: Mutex::new(HashMap::new()), config }
    }

    pub fn ttl(&self) -> Duration { self.config.ttl }
    pub fn max_body_bytes(&self) -> usize { self.config.max_body_bytes }

    /// Returns the entry for `key` if it is still fresh. Stale entries are
    /// removed on the way out.
    pub fn lookup(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let mut entries = self.entries.lock().ok()?;
        let entry = entries.get(key)?;
        if entry.is_fresh(Instant::now()) {
            return Some(Arc::clone(entry));
        }
        entries.remove(key);
        None
    }

    /// Inserts or replaces the entry for `key`. The last store wins.
    pub fn store(&self, key: CacheKey, entry: CacheEntry) {
        let max = self.config.max_entries;
        if max == 0 {
            return;
        }
        let Ok(mut entries) = self.entries.lock() else { return };
        if !entries.contains_key(&key) && entries.len() >= max {
            prune_locked(&mut entries, max);
        }
        debug!(key = %key, bytes = entry.body.len(), "micro-cache store");
        entries.insert(key, Arc::new(entry));
    }

    /// Drops expired entries, then evicts by insertion age until a store
    /// would fit.
    pub fn prune(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            prune_locked(&mut entries, self.config.max_entries);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map_or(0, |entries| entries.len())
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Whether a response with this head may be captured at all. The body
    /// size is checked again while streaming, since `content-length` is
    /// optional.
    ///
    /// Only complete `200` representations qualify: a `206` would be replayed
    /// to clients that never asked for a range.
    pub fn admits(&self, method: &Method, status: StatusCode, headers: &HeaderList) -> bool {
        if *method != Method::GET || status != StatusCode::OK || self.config.max_entries == 0 {
            return false;
        }
        if !varies_only_on_encoding(headers) {
            return false;
        }
        if !headers.get_str("content-type").is_some_and(is_textual) {
            return false;
        }
        if headers.contains("set-cookie") {
            return false;
        }
        let declared = headers.get_str("content-length").and_then(|v| v.parse::<u64>().ok());
        if declared.is_some_and(|len| len > self.config.max_body_bytes as u64) {
            return false;
        }
        !headers.get_all("cache-control")
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .any(|d| ["no-store", "no-cache", "private"].iter().any(|n| d.eq_ignore_ascii_case(n)))
    }
}

fn prune_locked(entries: &mut HashMap<CacheKey, Arc<CacheEntry>>, max: usize) {
    let now = Instant::now();
    let before = entries.len();
    entries.retain(|_, entry| entry.is_fresh(now));
    while !entries.is_empty() && entries.len() >= max {
        let oldest = entries.iter()
            .min_by_key(|(_, entry)| entry.inserted_at)
            .map(|(key, _)| key.clone());
        match oldest {
            Some(key) => { entries.remove(&key); }
            None => break,
        }
    }
    debug!(evicted = before - entries.len(), remaining = entries.len(), "micro-cache pruned");
}

/// The key already separates `accept-encoding`. A response that varies on
/// anything else (a cookie, credentials, `*`) is per-client.
fn varies_only_on_encoding(headers: &HeaderList) -> bool {
    headers.get_all("vary")
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .all(|field| field.eq_ignore_ascii_case("accept-encoding"))
}

/// Text, JSON, JavaScript and XML media types. Parameters are ignored.
pub fn is_textual(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    essence.starts_with("text/")
        || essence.ends_with("+json")
        || essence.ends_with("+xml")
        || matches!(
            essence.as_str(),
            "application/json" | "application/javascript" | "application/xml"
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderName, HeaderValue};

    fn cache(max_entries: usize) -> MicroCache {
        MicroCache::new(CacheConfig { ttl: Duration::from_secs(1), max_entries, max_body_bytes: 64 })
    }

    fn key(path: &str) -> CacheKey {
        CacheKey::new(&Method::GET, &path.parse().unwrap(), None)
    }

    fn entry(body: &'static str) -> CacheEntry {
        CacheEntry::new(StatusCode::OK, json_headers(), Bytes::from_static(body.as_bytes()), Duration::from_secs(1))
    }

    fn json_headers() -> HeaderList {
        [(HeaderName::from_static("content-type"), HeaderValue::from_static("application/json"))]
            .into_iter()
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_entries_are_served() {
        let cache = cache(8);
        cache.store(key("/api/stats"), entry("{\"ok\":true}"));

        tokio::time::advance(Duration::from_millis(999)).await;
        let hit = cache.lookup(&key("/api/stats")).expect("still fresh");
        assert_eq!(hit.body, Bytes::from_static(b"{\"ok\":true}"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_never_served() {
        let cache = cache(8);
        cache.store(key("/api/stats"), entry("{}"));

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(cache.lookup(&key("/api/stats")).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn entry_count_never_exceeds_the_limit() {
        let cache = cache(3);
        for i in 0..10 {
            cache.store(key(&format!("/api/rooms/{i}")), entry("{}"));
            assert!(cache.len() <= 3);
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        assert!(cache.lookup(&key("/api/rooms/9")).is_some());
        assert!(cache.lookup(&key("/api/rooms/0")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn prune_prefers_expired_entries() {
        let cache = cache(2);
        cache.store(key("/old"), entry("{}"));
        tokio::time::advance(Duration::from_millis(900)).await;
        cache.store(key("/young"), entry("{}"));
        tokio::time::advance(Duration::from_millis(200)).await;

        // `/old` has expired; storing a third key must evict it, not `/young`.
        cache.store(key("/new"), entry("{}"));
        assert_eq!(cache.len(), 2);
        assert!(cache.lookup(&key("/young")).is_some());
        assert!(cache.lookup(&key("/new")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn last_store_wins() {
        let cache = cache(2);
        cache.store(key("/api/stats"), entry("first"));
        cache.store(key("/api/stats"), entry("second"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(&key("/api/stats")).unwrap().body, Bytes::from_static(b"second"));
    }

    #[test]
    fn keys_separate_query_and_encoding() {
        let uri: Uri = "/api/cctvs?room=3".parse().unwrap();
        let plain = CacheKey::new(&Method::GET, &uri, None);
        let gzip = CacheKey::new(&Method::GET, &uri, Some("gzip"));
        assert_eq!(plain.as_str(), "GET /api/cctvs?room=3");
        assert_ne!(plain, gzip);
    }

    #[test]
    fn admission_rules() {
        let cache = cache(8);
        let json = json_headers();
        assert!(cache.admits(&Method::GET, StatusCode::OK, &json));
        assert!(!cache.admits(&Method::POST, StatusCode::OK, &json));
        assert!(!cache.admits(&Method::GET, StatusCode::NOT_FOUND, &json));

        let mut binary = HeaderList::new();
        binary.append(HeaderName::from_static("content-type"), HeaderValue::from_static("video/mp2t"));
        assert!(!cache.admits(&Method::GET, StatusCode::OK, &binary));

        let mut large = json_headers();
        large.append(HeaderName::from_static("content-length"), HeaderValue::from_static("65"));
        assert!(!cache.admits(&Method::GET, StatusCode::OK, &large));

        let mut private = json_headers();
        private.append(HeaderName::from_static("cache-control"), HeaderValue::from_static("private, max-age=60"));
        assert!(!cache.admits(&Method::GET, StatusCode::OK, &private));
    }

    #[test]
    fn partial_content_is_never_admitted() {
        let cache = cache(8);
        let mut partial = json_headers();
        partial.append(HeaderName::from_static("content-range"), HeaderValue::from_static("bytes 0-3/20"));
        assert!(!cache.admits(&Method::GET, StatusCode::PARTIAL_CONTENT, &partial));
        assert!(!cache.admits(&Method::GET, StatusCode::NO_CONTENT, &json_headers()));
    }

    #[test]
    fn vary_beyond_encoding_is_not_admitted() {
        let cache = cache(8);
        let vary = |value: &'static str| {
            let mut headers = json_headers();
            headers.append(HeaderName::from_static("vary"), HeaderValue::from_static(value));
            headers
        };
        assert!(cache.admits(&Method::GET, StatusCode::OK, &vary("Accept-Encoding")));
        assert!(!cache.admits(&Method::GET, StatusCode::OK, &vary("Cookie")));
        assert!(!cache.admits(&Method::GET, StatusCode::OK, &vary("accept-encoding, Authorization")));
        assert!(!cache.admits(&Method::GET, StatusCode::OK, &vary("*")));
    }

    #[test]
    fn textual_types() {
        assert!(is_textual("application/json; charset=utf-8"));
        assert!(is_textual("text/html"));
        assert!(is_textual("application/problem+json"));
        assert!(!is_textual("image/png"));
        assert!(!is_textual("application/vnd.apple.mpegurl"));
    }
}
