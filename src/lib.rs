//! # portico
//!
//! A caching, streaming edge gateway that puts one address in front of a
//! small web deployment: an API / admin origin, an SPA renderer, and
//! optionally a media server.
//!
//! ## What it does
//!
//! | Path | Origin | Policy |
//! |---|---|---|
//! | `/api/…` | API | micro-cached for about a second |
//! | `/admin/…` | API | passthrough |
//! | `/live/…` | media (when configured) | passthrough, streamed |
//! | anything else | SPA | static caching headers, CSP relaxed for the API |
//!
//! Extra prefixes can be added with `--route PREFIX=ORIGIN[:POLICY]`; the
//! longest matching prefix wins.
//!
//! - **Micro-cache**: identical `GET`s within the TTL are answered from
//!   memory, so a dashboard polled by fifty browsers costs the API one
//!   request per second.
//! - **Streaming**: response bodies are forwarded chunk by chunk; the
//!   gateway never buffers a whole response before sending it. Textual
//!   bodies are gzipped on the way through for clients that accept it.
//! - **Connection pool**: keep-alive sockets per origin, bounded, with a
//!   queue or spill policy once the ceiling is reached.
//! - **Workers**: a supervisor runs one single-threaded worker per core on a
//!   shared `SO_REUSEPORT` listener and relaunches any that die.
//!
//! What it leaves to something else: TLS, rate limiting, authentication,
//! WebSocket upgrades, and load balancing across replicas of one origin.
//!
//! ## Embedding
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use portico::{Gateway, GatewayConfig, Server};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), portico::Error> {
//!     let config = GatewayConfig::default();
//!     let server = Server::bind(config.listen)?;
//!     server.serve(Arc::new(Gateway::new(config))).await
//! }
//! ```

mod cache;
mod compress;
mod config;
mod error;
mod headers;
mod health;
mod pool;
mod proxy;
mod response;
mod rewrite;
mod router;
mod server;

pub mod body;
pub mod supervisor;

pub use body::{Body, BoxError, StreamingBody};
pub use cache::{CacheEntry, CacheKey, MicroCache};
pub use config::{
    API_ORIGIN, Args, CacheConfig, GatewayConfig, MEDIA_ORIGIN, Origin, OverflowPolicy, PoolConfig,
    RouteRule, SPA_ORIGIN,
};
pub use error::Error;
pub use headers::HeaderList;
pub use health::{Probe, Probes};
pub use pool::{Pool, PooledConnection};
pub use proxy::{CacheStatus, Gateway};
pub use router::{AssetClass, CachePolicy, Route, Router};
pub use server::{Server, run_worker, shutdown_signal};
pub use supervisor::Supervisor;
