//! Worker HTTP server and graceful shutdown.
//!
//! # One listener, many workers
//!
//! Every worker process binds the same address with `SO_REUSEPORT`, so the
//! kernel spreads incoming connections across them. A worker that dies takes
//! only its own connections with it; the others keep accepting.
//!
//! # Graceful shutdown
//!
//! On **SIGTERM** or Ctrl-C the worker:
//! 1. Stops `listener.accept()`, so no new connections are made.
//! 2. Tells every open connection to finish its in-flight request and then
//!    close, instead of waiting for the next one.
//! 3. Waits up to the shutdown grace period for those connections, then
//!    aborts whatever is left.
//!
//! Set `terminationGracePeriodSeconds` (or your init system's stop timeout)
//! longer than the grace period so the worker gets to finish step 3.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::body::{Body, BoxError};
use crate::config::GatewayConfig;
use crate::error::Error;
use crate::proxy::Gateway;

const BACKLOG: u32 = 1024;
const DEFAULT_GRACE: Duration = Duration::from_secs(30);

/// The per-worker HTTP server.
pub struct Server {
    listener: TcpListener,
    grace: Duration,
}

impl Server {
    /// Binds `addr` with `SO_REUSEPORT` (on Unix) so sibling workers can
    /// share it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(addr: SocketAddr) -> Result<Self, Error> {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        #[cfg(unix)]
        socket.set_reuseport(true)?;
        socket.bind(addr)?;
        Ok(Self::from_listener(socket.listen(BACKLOG)?))
    }

    /// Serves on an already-bound listener.
    pub fn from_listener(listener: TcpListener) -> Self {
        Self { listener, grace: DEFAULT_GRACE }
    }

    /// How long in-flight connections may take to finish after shutdown
    /// begins.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections and hands every request to `gateway` until
    /// SIGTERM or Ctrl-C, then drains.
    pub async fn serve(self, gateway: Arc<Gateway>) -> Result<(), Error> {
        self.serve_with_shutdown(gateway, shutdown_signal()).await
    }

    /// Like [`serve`](Server::serve), but shuts down when `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, gateway: Arc<Gateway>, signal: F) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        let Self { listener, grace } = self;
        info!(addr = %listener.local_addr()?, "portico worker listening");

        let (drain_tx, drain_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        tokio::pin!(signal);

        loop {
            tokio::select! {
                // Shutdown first, so a SIGTERM stops accepting even while
                // connections are still queued.
                biased;

                () = &mut signal => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, peer) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, "could not set TCP_NODELAY: {e}");
                    }
                    let gateway = Arc::clone(&gateway);
                    let mut draining = drain_rx.clone();
                    tasks.spawn(async move {
                        let io = TokioIo::new(stream);
                        // Called once per request on the connection.
                        let svc = service_fn(move |req| {
                            let gateway = Arc::clone(&gateway);
                            async move { dispatch(gateway, req, peer).await }
                        });

                        // HTTP/1.1 or HTTP/2, whichever the client speaks.
                        let builder = ConnBuilder::new(TokioExecutor::new());
                        let conn = builder.serve_connection(io, svc);
                        tokio::pin!(conn);

                        let result = tokio::select! {
                            res = conn.as_mut() => res,
                            _ = draining.changed() => {
                                conn.as_mut().graceful_shutdown();
                                conn.await
                            }
                        };
                        if let Err(e) = result {
                            debug!(%peer, "connection error: {e}");
                        }
                    });
                }

                // Reap finished connection tasks so the set does not grow
                // without bound.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        drop(listener);
        let _ = drain_tx.send(true);

        let drained = timeout(grace, async { while tasks.join_next().await.is_some() {} }).await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), grace_secs = grace.as_secs(), "grace period over, aborting connections");
            tasks.shutdown().await;
        }

        info!("portico worker stopped");
        Ok(())
    }
}

/// Runs one worker to completion on a single-threaded runtime: bind, serve
/// until a shutdown signal, drain.
pub fn run_worker(config: GatewayConfig) -> Result<(), Error> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let server = Server::bind(config.listen)?.with_shutdown_grace(config.shutdown_grace);
        let gateway = Arc::new(Gateway::new(config));
        let reaper = gateway.spawn_reaper();
        let result = server.serve(gateway).await;
        reaper.abort();
        result
    })
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Hands one request to the gateway. Infallible: every failure has already
/// become a response by the time it gets here.
async fn dispatch(
    gateway: Arc<Gateway>,
    req: hyper::Request<Incoming>,
    peer: SocketAddr,
) -> Result<http::Response<Body>, Infallible> {
    let req = req.map(|body| body.map_err(BoxError::from).boxed_unsync());
    Ok(gateway.handle(req, peer).await)
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first shutdown signal the process receives.
///
/// On Unix this listens for both **SIGTERM** (service managers, the
/// supervisor) and **SIGINT** (Ctrl-C, for local dev). On other platforms
/// only Ctrl-C is available.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let sigterm = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
