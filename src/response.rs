//! Responses the gateway writes itself.
//!
//! Proxied responses are the origin's own, streamed through. Everything here
//! is what the gateway says when it answers on its own: micro-cache hits,
//! built-in probes, and the short plain-text errors a client sees when an
//! origin cannot be reached. Error bodies never carry internal detail.

use http::header::{self, HeaderValue};
use http::{Response, StatusCode};

use crate::body::{self, Body};
use crate::cache::CacheEntry;
use crate::error::Error;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

// ── Plain text ────────────────────────────────────────────────────────────────

/// `text/plain` response that downstream caches must not keep.
pub fn text(status: StatusCode, message: &'static str) -> Response<Body> {
    let mut response = Response::new(body::full(message));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(TEXT_PLAIN));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

/// Terminal response for a failed upstream exchange.
///
/// | Failure | Status |
/// |---|---|
/// | refused, timed out, pool saturated, broken connection | 503 |
/// | anything else (a request the gateway could not build) | 500 |
pub fn failure(error: &Error) -> Response<Body> {
    match error {
        Error::Timeout(_) => text(StatusCode::SERVICE_UNAVAILABLE, "upstream timed out"),
        e if e.is_unavailable() => text(StatusCode::SERVICE_UNAVAILABLE, "upstream unavailable"),
        _ => text(StatusCode::INTERNAL_SERVER_ERROR, "gateway error"),
    }
}

// ── Micro-cache hits ──────────────────────────────────────────────────────────

/// Replays a cached entry: same status, same headers, same bytes.
pub fn cached(entry: &CacheEntry) -> Response<Body> {
    let mut response = Response::new(body::full(entry.body.clone()));
    *response.status_mut() = entry.status;
    entry.headers.write_to(response.headers_mut());
    with_age(response, entry)
}

/// `304 Not Modified` for a conditional request that matches a cached
/// entry's validator. Carries the entry's caching headers, no body.
pub fn not_modified(entry: &CacheEntry) -> Response<Body> {
    let mut response = Response::new(body::empty());
    *response.status_mut() = StatusCode::NOT_MODIFIED;
    for name in ["etag", "cache-control", "vary", "expires", "last-modified"] {
        for value in entry.headers.get_all(name) {
            response.headers_mut().append(header::HeaderName::from_static(name), value.clone());
        }
    }
    with_age(response, entry)
}

/// Whether `if-none-match` names the entry's `etag`. Weak comparison, as
/// RFC 9110 §13.1.2 requires for this header.
pub fn matches_etag(if_none_match: &str, entry: &CacheEntry) -> bool {
    let Some(etag) = entry.headers.get_str("etag") else { return false };
    let opaque = |tag: &str| tag.trim().trim_start_matches("W/").to_owned();
    let wanted = opaque(etag);
    if_none_match.split(',').any(|tag| tag.trim() == "*" || opaque(tag) == wanted)
}

fn with_age(mut response: Response<Body>, entry: &CacheEntry) -> Response<Body> {
    response.headers_mut().insert(header::AGE, HeaderValue::from(entry.age().as_secs()));
    response
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use http::header::HeaderName;
    use http_body_util::BodyExt;

    use super::*;
    use crate::headers::HeaderList;

    fn entry(etag: &'static str) -> CacheEntry {
        let headers: HeaderList = [
            (HeaderName::from_static("content-type"), HeaderValue::from_static("application/json")),
            (HeaderName::from_static("etag"), HeaderValue::from_static(etag)),
        ].into_iter().collect();
        CacheEntry::new(StatusCode::OK, headers, Bytes::from_static(b"[1,2,3]"), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn cached_responses_replay_the_entry() {
        let response = cached(&entry("\"v1\""));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "application/json");
        assert!(response.headers().contains_key("age"));
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"[1,2,3]"));
    }

    #[test]
    fn etag_matching_is_weak() {
        let e = entry("W/\"v1\"");
        assert!(matches_etag("\"v1\"", &e));
        assert!(matches_etag("\"v0\", W/\"v1\"", &e));
        assert!(matches_etag("*", &e));
        assert!(!matches_etag("\"v2\"", &e));
    }

    #[test]
    fn failures_are_short_and_generic() {
        let timeout = failure(&Error::Timeout(Duration::from_secs(3)));
        assert_eq!(timeout.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(timeout.headers()["content-type"], TEXT_PLAIN);

        let saturated = failure(&Error::Saturated("api".into()));
        assert_eq!(saturated.status(), StatusCode::SERVICE_UNAVAILABLE);

        let unknown = failure(&Error::UnknownOrigin("media".into()));
        assert_eq!(unknown.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
