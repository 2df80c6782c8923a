//! The proxy engine.
//!
//! One [`Gateway`] per worker owns that worker's routing table, micro-cache
//! and connection pool. Every request takes one of these paths:
//!
//! ```text
//! Received ─► probe?  ──────────────────────────────────────────► Served
//!    │
//!    ▼
//! Classified ─► cache hit ──────────────────────────────────────► Served
//!    │
//!    ▼ miss / not cacheable / bypass
//! ConnectionAcquired ─► Forwarding ─► Streaming (+ capture) ─► Served ─► ConnectionReleased
//!        │                  │
//!        └──── refused / timeout / saturated ──────────────────► Failed (503)
//! ```
//!
//! The upstream timeout covers acquiring a connection, sending the request
//! and receiving the response head. After that it bounds only the silence
//! between body frames, so a long transfer (a video segment) is never cut
//! short while an origin that stops sending is. Nothing is retried: a failed
//! non-idempotent request must not be replayed here.
//!
//! `x-cache` marks responses that came from an origin or from the cache.
//! Failures the gateway writes itself carry no `x-cache`.

use std::net::SocketAddr;
use std::sync::Arc;

use http::header::{self, HeaderName, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::{debug, error, warn};

use crate::body::{Body, BoxError, Capture, StreamingBody};
use crate::cache::{CacheKey, MicroCache};
use crate::compress::{self, GzipBody};
use crate::config::GatewayConfig;
use crate::error::Error;
use crate::headers::HeaderList;
use crate::health::Probes;
use crate::pool::Pool;
use crate::response;
use crate::rewrite;
use crate::router::{CachePolicy, Route, Router};

/// What the micro-cache contributed to a response, sent as `x-cache`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Bypass,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit    => "HIT",
            Self::Miss   => "MISS",
            Self::Bypass => "BYPASS",
        }
    }
}

pub struct Gateway {
    config: Arc<GatewayConfig>,
    router: Router,
    probes: Probes,
    cache: Arc<MicroCache>,
    pool: Arc<Pool>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        let cache = Arc::new(MicroCache::new(config.cache.clone()));
        Self::with_cache(config, cache)
    }

    /// Builds a gateway around an existing cache, so a caller can inspect
    /// it.
    pub fn with_cache(config: GatewayConfig, cache: Arc<MicroCache>) -> Self {
        let router = Router::from_config(&config);
        let pool = Arc::new(Pool::new(&config.origins, config.pool.clone()));
        Self { config: Arc::new(config), router, probes: Probes::new(), cache, pool }
    }

    pub fn config(&self) -> &GatewayConfig { &self.config }
    pub fn cache(&self) -> &Arc<MicroCache> { &self.cache }
    pub fn pool(&self) -> &Arc<Pool> { &self.pool }

    /// Spawns the task that closes idle upstream connections. Runs until
    /// aborted.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let pool = Arc::clone(&self.pool);
        let every = (self.config.pool.idle_timeout / 2).max(std::time::Duration::from_millis(100));
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(every);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                pool.reap();
            }
        })
    }

    /// Handles one client request. Never fails: every error becomes a
    /// response.
    pub async fn handle(&self, req: Request<Body>, peer: SocketAddr) -> Response<Body> {
        let started = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_owned();

        if let Some(probe) = self.probes.respond(&method, &path) {
            return probe;
        }

        let route = self.router.classify(&path);
        let bypass = req.headers().contains_key(&self.config.bypass_header);
        // A range is a slice of the representation, never the whole of it.
        let ranged = req.headers().contains_key(header::RANGE);
        let key = (route.policy() == CachePolicy::Micro && method == Method::GET && !ranged).then(|| {
            let encoding = req.headers().get(header::ACCEPT_ENCODING).and_then(|v| v.to_str().ok());
            CacheKey::new(&method, req.uri(), encoding)
        });

        let (outcome, cache_status) = match key {
            Some(_) if bypass => (self.forward(req, route, None, peer).await, Some(CacheStatus::Bypass)),
            Some(key) => match self.cache.lookup(&key) {
                Some(entry) => {
                    let conditional = req.headers().get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok());
                    let response = match conditional {
                        Some(tags) if response::matches_etag(tags, &entry) => response::not_modified(&entry),
                        _ => response::cached(&entry),
                    };
                    (Ok(response), Some(CacheStatus::Hit))
                }
                None => (self.forward(req, route, Some(key), peer).await, Some(CacheStatus::Miss)),
            },
            None => (self.forward(req, route, None, peer).await, None),
        };

        let (mut response, cache_status) = match outcome {
            Ok(response) => (response, cache_status),
            Err(e) => {
                if e.is_unavailable() {
                    warn!(origin = route.origin(), error = %e, "upstream request failed");
                } else {
                    error!(origin = route.origin(), error = %e, "could not build upstream request");
                }
                (response::failure(&e), None)
            }
        };

        let elapsed = started.elapsed();
        let headers = response.headers_mut();
        if let Some(status) = cache_status {
            headers.insert(HeaderName::from_static("x-cache"), HeaderValue::from_static(status.as_str()));
        }
        if let Ok(value) = HeaderValue::from_str(&format!("{}ms", elapsed.as_millis())) {
            headers.insert(HeaderName::from_static("x-response-time"), value);
        }

        let status = response.status().as_u16();
        let cache = cache_status.map_or("-", CacheStatus::as_str);
        let elapsed_ms = elapsed.as_millis() as u64;
        if elapsed > self.config.slow_request {
            warn!(%method, %path, origin = route.origin(), status, cache, elapsed_ms, "slow request");
        } else {
            debug!(%method, %path, origin = route.origin(), status, cache, elapsed_ms, "request served");
        }
        response
    }

    /// Sends `req` to the route's origin and streams the answer back. An
    /// origin's own error statuses are responses, not errors.
    async fn forward(
        &self,
        req: Request<Body>,
        route: Route<'_>,
        key: Option<CacheKey>,
        peer: SocketAddr,
    ) -> Result<Response<Body>, Error> {
        let origin = route.origin();
        let gzip = self.config.compression && req.headers().get(header::ACCEPT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(compress::accepts_gzip);
        let outbound = self.outbound_request(req, origin, peer)?;
        let method = outbound.method().clone();

        let exchange = async {
            let mut conn = self.pool.acquire(origin).await?;
            let upstream = conn.send(outbound).await?;
            Ok::<_, Error>((conn, upstream))
        };
        let (conn, upstream) = timeout(self.config.upstream_timeout, exchange).await
            .map_err(|_| Error::Timeout(self.config.upstream_timeout))??;

        let (mut parts, body) = upstream.into_parts();
        let mut headers = HeaderList::from_map(&parts.headers);
        rewrite::sanitize_response(&mut headers);
        self.apply_policies(&mut headers, &route, &method, parts.status);

        let mut body = body.map_err(BoxError::from).boxed_unsync();
        if gzip && compress::should_compress(&method, parts.status, &headers, self.config.compress_min_bytes) {
            compress::mark_encoded(&mut headers);
            body = GzipBody::new(body).boxed_unsync();
        }

        // Captured after encoding: the key already carries accept-encoding.
        let capture = key
            .filter(|_| self.cache.admits(&method, parts.status, &headers))
            .map(|key| Capture::new(key, parts.status, headers.clone(), Arc::clone(&self.cache)));

        parts.headers = headers.into_map();
        let body = StreamingBody::new(body, Arc::clone(&self.pool), conn, capture, self.config.upstream_timeout);
        Ok(Response::from_parts(parts, body.boxed_unsync()))
    }

    /// Rewrites a client request for `origin`: origin-form target, origin
    /// `host`, hop-by-hop headers removed, forwarding headers added. The
    /// body is passed through as is.
    fn outbound_request(&self, req: Request<Body>, origin: &str, peer: SocketAddr) -> Result<Request<Body>, Error> {
        let target = self.config.origin(origin)
            .ok_or_else(|| Error::UnknownOrigin(origin.to_owned()))?;
        let (parts, body) = req.into_parts();

        let client_host = parts.headers.get(header::HOST).cloned().or_else(|| {
            parts.uri.authority().and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        });
        let mut headers = HeaderList::from_map(&parts.headers);
        rewrite::sanitize_request(&mut headers);
        rewrite::forwarded(&mut headers, peer, client_host);

        let path = parts.uri.path_and_query().map_or("/", |pq| pq.as_str());
        let mut builder = Request::builder()
            .method(parts.method)
            .uri(path)
            .header(header::HOST, target.authority.as_str());
        if let Some(map) = builder.headers_mut() {
            headers.write_to(map);
        }
        Ok(builder.body(body)?)
    }

    fn apply_policies(&self, headers: &mut HeaderList, route: &Route<'_>, method: &Method, status: StatusCode) {
        if route.rule.relax_csp {
            rewrite::relax_csp_headers(headers, &self.config.public_api_origin);
        }
        if status.is_success() && (*method == Method::GET || *method == Method::HEAD) {
            if let Some(value) = rewrite::cache_control(route.policy(), route.asset, self.cache.ttl()) {
                headers.set_if_absent(header::CACHE_CONTROL, value);
            }
        }
        if let Some(allow) = &self.config.cors_allow_origin {
            headers.set_if_absent(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow.clone());
        }
    }
}
