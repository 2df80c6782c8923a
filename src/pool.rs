//! Upstream connection pool.
//!
//! Keep-alive HTTP/1.1 connections, one set per origin. A connection is
//! borrowed for exactly one request/response exchange and handed back with
//! [`Pool::release`] once the response body has been read to the end.
//! Anything dropped without `release` is closed, never reused.
//!
//! Per origin:
//! - `max_sockets` bounds connections out on loan at once;
//! - `max_idle` bounds connections parked between requests;
//! - parked connections older than `idle_timeout` are closed, on the next
//!   acquire or by [`Pool::reap`], whichever comes first.
//!
//! When an origin is at its socket ceiling the [`OverflowPolicy`] decides:
//! wait in a bounded queue for a bounded time, or spill onto a one-off
//! connection. `acquire` never waits without bound.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::{Request, Response};
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

use crate::body::Body;
use crate::config::{Origin, OverflowPolicy, PoolConfig};
use crate::error::Error;

/// A connection on loan from the [`Pool`].
pub struct PooledConnection {
    origin: String,
    sender: SendRequest<Body>,
    /// `None` for spill connections, which never go back to the pool.
    permit: Option<OwnedSemaphorePermit>,
    reused: bool,
}

impl PooledConnection {
    pub fn origin(&self) -> &str { &self.origin }

    /// Whether this connection had already served an earlier request.
    pub fn is_reused(&self) -> bool { self.reused }

    /// Whether [`Pool::release`] will keep this connection.
    pub fn is_pooled(&self) -> bool { self.permit.is_some() }

    /// Sends one request and resolves once the response head has arrived.
    /// The body streams afterwards.
    pub async fn send(&mut self, req: Request<Body>) -> Result<Response<Incoming>, Error> {
        Ok(self.sender.send_request(req).await?)
    }
}

struct IdleConnection {
    sender: SendRequest<Body>,
    since: Instant,
}

struct OriginPool {
    origin: Origin,
    idle: Mutex<Vec<IdleConnection>>,
    sockets: Arc<Semaphore>,
    waiting: AtomicUsize,
}

/// Decrements the waiter count when an acquire leaves the queue, however it
/// leaves.
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct Pool {
    origins: HashMap<String, OriginPool>,
    config: PoolConfig,
}

impl Pool {
    pub fn new(origins: &[Origin], config: PoolConfig) -> Self {
        let origins = origins.iter()
            .map(|origin| {
                let pool = OriginPool {
                    origin: origin.clone(),
                    idle: Mutex::new(Vec::new()),
                    sockets: Arc::new(Semaphore::new(config.max_sockets)),
                    waiting: AtomicUsize::new(0),
                };
                (origin.name.clone(), pool)
            })
            .collect();
        Self { origins, config }
    }

    pub fn config(&self) -> &PoolConfig { &self.config }

    /// Borrows a connection to `origin`: a parked one if any is still
    /// usable, otherwise a fresh one.
    pub async fn acquire(&self, origin: &str) -> Result<PooledConnection, Error> {
        let pool = self.origins.get(origin)
            .ok_or_else(|| Error::UnknownOrigin(origin.to_owned()))?;
        let permit = self.permit(pool).await?;

        if permit.is_some() {
            if let Some(sender) = self.checkout(pool).await {
                debug!(origin, "reusing upstream connection");
                return Ok(PooledConnection { origin: origin.to_owned(), sender, permit, reused: true });
            }
        }

        let sender = connect(&pool.origin, self.config.connect_timeout).await?;
        Ok(PooledConnection { origin: origin.to_owned(), sender, permit, reused: false })
    }

    /// Returns a connection whose last response was read to completion.
    /// Spill connections, closed connections and anything beyond
    /// `max_idle` are dropped instead.
    pub fn release(&self, conn: PooledConnection) {
        let PooledConnection { origin, sender, permit, .. } = conn;
        if permit.is_none() || sender.is_closed() {
            return;
        }
        let Some(pool) = self.origins.get(&origin) else { return };
        let Ok(mut idle) = pool.idle.lock() else { return };
        if idle.len() >= self.config.max_idle {
            return;
        }
        idle.push(IdleConnection { sender, since: Instant::now() });
    }

    /// Closes parked connections that have been idle too long or that the
    /// origin has already closed. Returns how many were dropped.
    pub fn reap(&self) -> usize {
        let limit = self.config.idle_timeout;
        let mut reaped = 0;
        for pool in self.origins.values() {
            let Ok(mut idle) = pool.idle.lock() else { continue };
            let before = idle.len();
            idle.retain(|conn| conn.since.elapsed() <= limit && !conn.sender.is_closed());
            reaped += before - idle.len();
        }
        if reaped > 0 {
            debug!(reaped, "closed idle upstream connections");
        }
        reaped
    }

    pub fn idle_count(&self, origin: &str) -> usize {
        self.origins.get(origin)
            .and_then(|pool| pool.idle.lock().ok().map(|idle| idle.len()))
            .unwrap_or(0)
    }

    /// Pooled connections currently on loan to `origin`.
    pub fn in_use(&self, origin: &str) -> usize {
        self.origins.get(origin)
            .map_or(0, |pool| self.config.max_sockets - pool.sockets.available_permits())
    }

    async fn permit(&self, pool: &OriginPool) -> Result<Option<OwnedSemaphorePermit>, Error> {
        let saturated = || Error::Saturated(pool.origin.name.clone());
        match Arc::clone(&pool.sockets).try_acquire_owned() {
            Ok(permit) => return Ok(Some(permit)),
            Err(TryAcquireError::Closed) => return Err(saturated()),
            Err(TryAcquireError::NoPermits) => {}
        }

        match self.config.overflow {
            OverflowPolicy::Spill => {
                debug!(origin = %pool.origin.name, "socket ceiling reached; opening a spill connection");
                Ok(None)
            }
            OverflowPolicy::Queue => {
                let ahead = pool.waiting.fetch_add(1, Ordering::AcqRel);
                let _slot = QueueSlot(&pool.waiting);
                if ahead >= self.config.queue_limit {
                    warn!(origin = %pool.origin.name, waiting = ahead, "upstream queue full");
                    return Err(saturated());
                }
                match timeout(self.config.queue_timeout, Arc::clone(&pool.sockets).acquire_owned()).await {
                    Ok(Ok(permit)) => Ok(Some(permit)),
                    _ => Err(saturated()),
                }
            }
        }
    }

    async fn checkout(&self, pool: &OriginPool) -> Option<SendRequest<Body>> {
        loop {
            // Most recently parked first: the warmest socket.
            let candidate = pool.idle.lock().ok()?.pop()?;
            if candidate.since.elapsed() > self.config.idle_timeout || candidate.sender.is_closed() {
                continue;
            }
            let mut sender = candidate.sender;
            if let Ok(Ok(())) = timeout(self.config.connect_timeout, sender.ready()).await {
                return Some(sender);
            }
        }
    }
}

async fn connect(origin: &Origin, limit: Duration) -> Result<SendRequest<Body>, Error> {
    let addr = origin.authority.as_str();
    let stream = match timeout(limit, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return Err(Error::Connect { origin: origin.name.clone(), source }),
        Err(_) => return Err(Error::Timeout(limit)),
    };
    stream.set_nodelay(true)?;

    let (sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
    let name = origin.name.clone();
    // The connection future drives the socket. It ends when every
    // `SendRequest` for it has been dropped, or on error.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(origin = %name, "upstream connection closed: {e}");
        }
    });

    debug!(origin = %origin.name, addr, "opened upstream connection");
    Ok(sender)
}
