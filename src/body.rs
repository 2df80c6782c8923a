//! Response bodies.
//!
//! Every body the gateway hands to hyper, in either direction, is a [`Body`].
//! Proxied responses are wrapped in a [`StreamingBody`], which forwards each
//! frame as soon as the origin produces it and, on the side, keeps a bounded
//! copy for the micro-cache.
//!
//! # Lifecycle of a proxied body
//!
//! ```text
//! origin frame ──► StreamingBody::poll_frame ──► client
//!                        │
//!                        ├─ capture active?  append, or abandon past the ceiling
//!                        └─ end of stream?   release connection, commit capture
//! ```
//!
//! If hyper drops the body first (the client went away), neither happens: the
//! capture is discarded and the upstream connection, left mid-response, is
//! closed instead of pooled.
//!
//! An origin that goes quiet mid-body is treated the same way. Once the idle
//! deadline passes with no frame, the body ends with [`Error::Timeout`] and
//! the connection is closed, so a stalled origin cannot pin a pool permit.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body as _, Frame, SizeHint};
use tokio::time::{Instant, Sleep, sleep};
use tracing::{debug, warn};

use crate::cache::{CacheEntry, CacheKey, MicroCache};
use crate::error::Error;
use crate::headers::HeaderList;
use crate::pool::{Pool, PooledConnection};

/// Error carried by a [`Body`]: a hyper transport error, a compression
/// failure or an idle timeout.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The one body type used for requests and responses.
pub type Body = UnsyncBoxBody<Bytes, BoxError>;

pub fn full(bytes: impl Into<Bytes>) -> Body {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed_unsync()
}

pub fn empty() -> Body {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
}

// ── Capture ───────────────────────────────────────────────────────────────────

/// A bounded copy of a response on its way into the micro-cache.
pub(crate) struct Capture {
    key: CacheKey,
    status: StatusCode,
    headers: HeaderList,
    buf: BytesMut,
    limit: usize,
    cache: Arc<MicroCache>,
}

impl Capture {
    pub(crate) fn new(key: CacheKey, status: StatusCode, headers: HeaderList, cache: Arc<MicroCache>) -> Self {
        let limit = cache.max_body_bytes();
        Self { key, status, headers, buf: BytesMut::new(), limit, cache }
    }

    /// Appends `data`. Returns `false` once the copy would exceed the ceiling.
    fn push(&mut self, data: &Bytes) -> bool {
        if self.buf.len() + data.len() > self.limit {
            return false;
        }
        self.buf.extend_from_slice(data);
        true
    }

    fn commit(self) {
        let ttl = self.cache.ttl();
        let entry = CacheEntry::new(self.status, self.headers, self.buf.freeze(), ttl);
        self.cache.store(self.key, entry);
    }
}

// ── StreamingBody ─────────────────────────────────────────────────────────────

/// Pass-through body over an origin response.
pub struct StreamingBody {
    inner: Body,
    upstream: Option<(Arc<Pool>, PooledConnection)>,
    capture: Option<Capture>,
    idle: Duration,
    deadline: Pin<Box<Sleep>>,
    /// Whether `deadline` is armed for the current wait.
    waiting: bool,
    done: bool,
}

impl StreamingBody {
    /// `idle` bounds the wait for each frame, not the whole transfer.
    pub(crate) fn new(
        inner: Body,
        pool: Arc<Pool>,
        conn: PooledConnection,
        capture: Option<Capture>,
        idle: Duration,
    ) -> Self {
        let mut body = Self {
            inner,
            upstream: Some((pool, conn)),
            capture,
            idle,
            deadline: Box::pin(sleep(idle)),
            waiting: false,
            done: false,
        };
        // Bodiless responses (204, 304, HEAD) may never be polled.
        if body.inner.is_end_stream() {
            body.finish();
        }
        body
    }

    fn observe(&mut self, data: &Bytes) {
        let Some(capture) = self.capture.as_mut() else { return };
        if !capture.push(data) {
            debug!(key = %capture.key, limit = capture.limit, "body exceeds micro-cache ceiling; not caching");
            self.capture = None;
        }
    }

    fn finish(&mut self) {
        self.done = true;
        if let Some((pool, conn)) = self.upstream.take() {
            pool.release(conn);
        }
        if let Some(capture) = self.capture.take() {
            capture.commit();
        }
    }

    fn fail(&mut self, error: &BoxError) {
        debug!("upstream body failed: {error}");
        self.done = true;
        self.capture = None;
        self.upstream = None;
    }

    /// Polls the idle deadline, arming it first if this is a fresh wait.
    fn stalled(&mut self, cx: &mut Context<'_>) -> bool {
        if !self.waiting {
            self.waiting = true;
            self.deadline.as_mut().reset(Instant::now() + self.idle);
        }
        self.deadline.as_mut().poll(cx).is_ready()
    }
}

impl hyper::body::Body for StreamingBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        let Poll::Ready(polled) = Pin::new(&mut this.inner).poll_frame(cx) else {
            if !this.stalled(cx) {
                return Poll::Pending;
            }
            if let Some((_, conn)) = &this.upstream {
                warn!(origin = conn.origin(), idle_ms = this.idle.as_millis() as u64, "origin stalled mid-body; closing upstream connection");
            }
            let e: BoxError = Box::new(Error::Timeout(this.idle));
            this.fail(&e);
            return Poll::Ready(Some(Err(e)));
        };
        this.waiting = false;
        match polled {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    this.observe(data);
                }
                if this.inner.is_end_stream() {
                    this.finish();
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(e)) => {
                this.fail(&e);
                Poll::Ready(Some(Err(e)))
            }
            None => {
                this.finish();
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for StreamingBody {
    fn drop(&mut self) {
        if let Some((_, conn)) = &self.upstream {
            debug!(origin = conn.origin(), "response dropped mid-stream; discarding upstream connection");
        }
    }
}
