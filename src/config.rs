//! Operational configuration.
//!
//! Every knob is a command-line flag backed by a `PORTICO_*` environment
//! variable. [`Args`] is the raw surface; [`Args::into_config`] validates it
//! into the immutable [`GatewayConfig`] each worker is built from.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use http::header::{HeaderName, HeaderValue};
use http::uri::{Authority, Scheme, Uri};

use crate::error::Error;
use crate::router::CachePolicy;

pub const API_ORIGIN: &str = "api";
pub const SPA_ORIGIN: &str = "spa";
pub const MEDIA_ORIGIN: &str = "media";

// ── Typed configuration ───────────────────────────────────────────────────────

/// A backend HTTP service the gateway forwards to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Origin {
    pub name: String,
    /// `host:port`, used both to connect and as the outbound `host` header.
    pub authority: Authority,
}

impl Origin {
    /// Parses `http://host[:port]`. Only plain HTTP is supported; the port
    /// defaults to 80.
    pub fn parse(name: &str, url: &str) -> Result<Self, Error> {
        let uri: Uri = url.parse()
            .map_err(|e| Error::Config(format!("origin `{name}`: invalid url `{url}`: {e}")))?;
        if uri.scheme().is_some_and(|s| *s != Scheme::HTTP) {
            return Err(Error::Config(format!("origin `{name}`: only http:// origins are supported")));
        }
        let authority = uri.authority()
            .ok_or_else(|| Error::Config(format!("origin `{name}`: `{url}` has no host")))?;
        let authority = match authority.port_u16() {
            Some(_) => authority.clone(),
            None => format!("{}:80", authority.host()).parse()
                .map_err(|e| Error::Config(format!("origin `{name}`: {e}")))?,
        };
        Ok(Self { name: name.to_owned(), authority })
    }
}

/// One entry of the routing table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteRule {
    pub prefix: String,
    pub origin: String,
    pub policy: CachePolicy,
    /// Widen `connect-src` in the origin's content-security-policy so pages
    /// it serves may call the API through the gateway.
    pub relax_csp: bool,
}

impl RouteRule {
    pub fn new(prefix: &str, origin: &str, policy: CachePolicy) -> Self {
        Self { prefix: prefix.to_owned(), origin: origin.to_owned(), policy, relax_csp: false }
    }
}

/// Parses `PREFIX=ORIGIN[:POLICY]`, e.g. `/storage=api:static`.
impl FromStr for RouteRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::Config(format!("route `{s}`: expected PREFIX=ORIGIN[:POLICY]"));
        let (prefix, target) = s.split_once('=').ok_or_else(invalid)?;
        let (origin, policy) = match target.split_once(':') {
            Some((origin, policy)) => (origin, policy.parse()?),
            None => (target, CachePolicy::Passthrough),
        };
        if !prefix.starts_with('/') || origin.is_empty() {
            return Err(invalid());
        }
        let prefix = match prefix.trim_end_matches('/') {
            "" => "/",
            trimmed => trimmed,
        };
        Ok(Self::new(prefix, origin, policy))
    }
}

/// What [`Pool::acquire`](crate::Pool::acquire) does once an origin's socket
/// ceiling is reached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OverflowPolicy {
    /// Wait in a bounded queue for a socket to free up.
    #[default]
    Queue,
    /// Open a one-off connection that is closed after the request.
    Spill,
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub max_entries: usize,
    pub max_body_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl: Duration::from_secs(1), max_entries: 1024, max_body_bytes: 1024 * 1024 }
    }
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub max_sockets: usize,
    pub max_idle: usize,
    pub idle_timeout: Duration,
    pub overflow: OverflowPolicy,
    pub queue_limit: usize,
    pub queue_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sockets: 50,
            max_idle: 10,
            idle_timeout: Duration::from_secs(15),
            overflow: OverflowPolicy::Queue,
            queue_limit: 256,
            queue_timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(1),
        }
    }
}

/// Everything one worker needs. Built once at startup, never mutated.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub listen: SocketAddr,
    pub origins: Vec<Origin>,
    /// Prefix rules in configuration order; see [`Router`](crate::Router) for
    /// how ties are broken.
    pub routes: Vec<RouteRule>,
    /// Rule applied when no prefix matches.
    pub fallback: RouteRule,
    pub cache: CacheConfig,
    pub pool: PoolConfig,
    /// Bound on acquire + send + response head for one upstream exchange,
    /// and on the silence between two body frames.
    pub upstream_timeout: Duration,
    pub bypass_header: HeaderName,
    /// The API origin as browsers see it, appended to `connect-src`.
    pub public_api_origin: String,
    pub cors_allow_origin: Option<HeaderValue>,
    /// Gzip textual responses for clients that accept it.
    pub compression: bool,
    /// Responses that declare a smaller `content-length` are sent as is.
    pub compress_min_bytes: usize,
    pub slow_request: Duration,
    pub workers: usize,
    pub shutdown_grace: Duration,
    pub respawn_delay: Duration,
}

impl GatewayConfig {
    pub fn origin(&self, name: &str) -> Option<&Origin> {
        self.origins.iter().find(|o| o.name == name)
    }

    /// The stock routing table for an API/admin origin, an optional media
    /// origin, and the SPA as fallback.
    pub fn default_routes(with_media: bool) -> Vec<RouteRule> {
        let mut routes = vec![
            RouteRule::new("/api", API_ORIGIN, CachePolicy::Micro),
            RouteRule::new("/admin", API_ORIGIN, CachePolicy::Passthrough),
        ];
        if with_media {
            routes.push(RouteRule::new("/live", MEDIA_ORIGIN, CachePolicy::Passthrough));
        }
        routes
    }

    pub fn default_fallback() -> RouteRule {
        RouteRule { relax_csp: true, ..RouteRule::new("/", SPA_ORIGIN, CachePolicy::Static) }
    }

    fn validate(&self) -> Result<(), Error> {
        for rule in self.routes.iter().chain(std::iter::once(&self.fallback)) {
            if self.origin(&rule.origin).is_none() {
                return Err(Error::Config(format!(
                    "route `{}` targets unknown origin `{}`", rule.prefix, rule.origin
                )));
            }
        }
        if self.workers == 0 {
            return Err(Error::Config("worker count must be at least 1".into()));
        }
        if self.pool.max_sockets == 0 {
            return Err(Error::Config("max sockets per origin must be at least 1".into()));
        }
        Ok(())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let origins = [(API_ORIGIN, "127.0.0.1:8001"), (SPA_ORIGIN, "127.0.0.1:3001")]
            .into_iter()
            .filter_map(|(name, addr)| Some(Origin { name: name.to_owned(), authority: addr.parse().ok()? }))
            .collect();
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8000)),
            origins,
            routes: Self::default_routes(false),
            fallback: Self::default_fallback(),
            cache: CacheConfig::default(),
            pool: PoolConfig::default(),
            upstream_timeout: Duration::from_secs(3),
            bypass_header: HeaderName::from_static("x-cache-bypass"),
            public_api_origin: "http://127.0.0.1:8000".to_owned(),
            cors_allow_origin: None,
            compression: true,
            compress_min_bytes: 1024,
            slow_request: Duration::from_millis(100),
            workers: 1,
            shutdown_grace: Duration::from_secs(30),
            respawn_delay: Duration::from_millis(100),
        }
    }
}

// ── Command line / environment ────────────────────────────────────────────────

/// Caching, streaming edge gateway for an API origin, an SPA origin and a
/// media origin.
#[derive(Parser, Debug, Clone)]
#[command(name = "portico", author, version, about, long_about = None)]
pub struct Args {
    /// Address every worker listens on
    #[arg(long, env = "PORTICO_LISTEN", default_value = "0.0.0.0:8000")]
    pub listen: SocketAddr,

    /// API and admin-panel origin
    #[arg(long, env = "PORTICO_API_ORIGIN", default_value = "http://127.0.0.1:8001")]
    pub api_origin: String,

    /// SPA renderer origin, the fallback for unmatched paths
    #[arg(long, env = "PORTICO_SPA_ORIGIN", default_value = "http://127.0.0.1:3001")]
    pub spa_origin: String,

    /// Media origin serving HLS under /live
    #[arg(long, env = "PORTICO_MEDIA_ORIGIN")]
    pub media_origin: Option<String>,

    /// Extra route, PREFIX=ORIGIN[:passthrough|micro|static]; repeatable
    #[arg(long = "route", env = "PORTICO_ROUTES", value_delimiter = ',')]
    pub routes: Vec<RouteRule>,

    /// Number of worker processes (0 = one per CPU)
    #[arg(long, env = "PORTICO_WORKERS", default_value_t = 0)]
    pub workers: usize,

    /// Micro-cache time to live in milliseconds
    #[arg(long, env = "PORTICO_CACHE_TTL_MS", default_value_t = 1000)]
    pub cache_ttl_ms: u64,

    /// Maximum number of micro-cache entries per worker
    #[arg(long, env = "PORTICO_CACHE_MAX_ENTRIES", default_value_t = 1024)]
    pub cache_max_entries: usize,

    /// Largest response body the micro-cache will hold, in bytes
    #[arg(long, env = "PORTICO_CACHE_MAX_BODY_BYTES", default_value_t = 1024 * 1024)]
    pub cache_max_body_bytes: usize,

    /// Request header that skips the micro-cache
    #[arg(long, env = "PORTICO_BYPASS_HEADER", default_value = "x-cache-bypass")]
    pub bypass_header: HeaderName,

    /// Concurrent upstream sockets per origin
    #[arg(long, env = "PORTICO_MAX_SOCKETS", default_value_t = 50)]
    pub max_sockets: usize,

    /// Idle upstream sockets kept per origin
    #[arg(long, env = "PORTICO_MAX_IDLE", default_value_t = 10)]
    pub max_idle: usize,

    /// Idle upstream sockets are closed after this many milliseconds
    #[arg(long, env = "PORTICO_IDLE_TIMEOUT_MS", default_value_t = 15_000)]
    pub idle_timeout_ms: u64,

    /// Behaviour once an origin's socket ceiling is reached
    #[arg(long, env = "PORTICO_OVERFLOW", value_enum, default_value_t = OverflowPolicy::Queue)]
    pub overflow: OverflowPolicy,

    /// Requests allowed to wait for a socket under the queue policy
    #[arg(long, env = "PORTICO_QUEUE_LIMIT", default_value_t = 256)]
    pub queue_limit: usize,

    /// Upstream TCP connect timeout in milliseconds
    #[arg(long, env = "PORTICO_CONNECT_TIMEOUT_MS", default_value_t = 1000)]
    pub connect_timeout_ms: u64,

    /// Upstream timeout (acquire, send, response head, and each gap between
    /// body chunks) in milliseconds
    #[arg(long, env = "PORTICO_UPSTREAM_TIMEOUT_MS", default_value_t = 3000)]
    pub upstream_timeout_ms: u64,

    /// API origin as browsers reach it, added to CSP connect-src
    #[arg(long, env = "PORTICO_PUBLIC_API_ORIGIN", default_value = "http://127.0.0.1:8000")]
    pub public_api_origin: String,

    /// Access-Control-Allow-Origin added when an origin sends none
    #[arg(long, env = "PORTICO_CORS_ALLOW_ORIGIN")]
    pub cors_allow_origin: Option<HeaderValue>,

    /// Send responses uncompressed even when the client accepts gzip
    #[arg(long, env = "PORTICO_NO_COMPRESSION")]
    pub no_compression: bool,

    /// Smallest declared body, in bytes, worth compressing
    #[arg(long, env = "PORTICO_COMPRESS_MIN_BYTES", default_value_t = 1024)]
    pub compress_min_bytes: usize,

    /// Requests slower than this many milliseconds are logged as warnings
    #[arg(long, env = "PORTICO_SLOW_REQUEST_MS", default_value_t = 100)]
    pub slow_request_ms: u64,

    /// Seconds to drain in-flight requests on shutdown
    #[arg(long, env = "PORTICO_SHUTDOWN_GRACE_SECS", default_value_t = 30)]
    pub shutdown_grace_secs: u64,

    /// Delay before an exited worker is relaunched, in milliseconds
    #[arg(long, env = "PORTICO_RESPAWN_DELAY_MS", default_value_t = 100)]
    pub respawn_delay_ms: u64,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "PORTICO_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Run a single worker in this process instead of supervising
    #[arg(long, hide = true)]
    pub worker: bool,
}

impl Args {
    pub fn into_config(self) -> Result<GatewayConfig, Error> {
        let mut origins = vec![
            Origin::parse(API_ORIGIN, &self.api_origin)?,
            Origin::parse(SPA_ORIGIN, &self.spa_origin)?,
        ];
        if let Some(url) = &self.media_origin {
            origins.push(Origin::parse(MEDIA_ORIGIN, url)?);
        }

        let mut routes = GatewayConfig::default_routes(self.media_origin.is_some());
        routes.extend(self.routes);

        let workers = match self.workers {
            0 => std::thread::available_parallelism().map_or(1, |n| n.get()),
            n => n,
        };

        let upstream_timeout = Duration::from_millis(self.upstream_timeout_ms);
        let config = GatewayConfig {
            listen: self.listen,
            origins,
            routes,
            fallback: GatewayConfig::default_fallback(),
            cache: CacheConfig {
                ttl: Duration::from_millis(self.cache_ttl_ms),
                max_entries: self.cache_max_entries,
                max_body_bytes: self.cache_max_body_bytes,
            },
            pool: PoolConfig {
                max_sockets: self.max_sockets,
                max_idle: self.max_idle,
                idle_timeout: Duration::from_millis(self.idle_timeout_ms),
                overflow: self.overflow,
                queue_limit: self.queue_limit,
                queue_timeout: upstream_timeout,
                connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            },
            upstream_timeout,
            bypass_header: self.bypass_header,
            public_api_origin: self.public_api_origin,
            cors_allow_origin: self.cors_allow_origin,
            compression: !self.no_compression,
            compress_min_bytes: self.compress_min_bytes,
            slow_request: Duration::from_millis(self.slow_request_ms),
            workers,
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            respawn_delay: Duration::from_millis(self.respawn_delay_ms),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_defaults_port_80() {
        let origin = Origin::parse("api", "http://backend").unwrap();
        assert_eq!(origin.authority.as_str(), "backend:80");
    }

    #[test]
    fn origin_rejects_https() {
        assert!(matches!(Origin::parse("api", "https://backend:443"), Err(Error::Config(_))));
    }

    #[test]
    fn route_rule_parses_policy() {
        let rule: RouteRule = "/storage/=api:static".parse().unwrap();
        assert_eq!(rule, RouteRule::new("/storage", "api", CachePolicy::Static));

        let rule: RouteRule = "/livewire=api".parse().unwrap();
        assert_eq!(rule.policy, CachePolicy::Passthrough);

        assert!("storage=api".parse::<RouteRule>().is_err());
        assert!("/x=api:forever".parse::<RouteRule>().is_err());
    }

    #[test]
    fn args_build_a_valid_config() {
        let args = Args::try_parse_from([
            "portico",
            "--workers", "2",
            "--media-origin", "http://127.0.0.1:8888",
            "--route", "/storage=api:static",
            "--cache-ttl-ms", "500",
        ]).unwrap();
        let config = args.into_config().unwrap();

        assert_eq!(config.workers, 2);
        assert_eq!(config.cache.ttl, Duration::from_millis(500));
        let prefixes: Vec<_> = config.routes.iter().map(|r| r.prefix.as_str()).collect();
        assert_eq!(prefixes, ["/api", "/admin", "/live", "/storage"]);
        assert!(config.origin(MEDIA_ORIGIN).is_some());
        assert!(config.compression);
    }

    #[test]
    fn compression_can_be_switched_off() {
        let args = Args::try_parse_from(["portico", "--workers", "1", "--no-compression"]).unwrap();
        assert!(!args.into_config().unwrap().compression);
    }

    #[test]
    fn route_to_unknown_origin_is_rejected() {
        let args = Args::try_parse_from(["portico", "--workers", "1", "--route", "/x=nowhere"]).unwrap();
        assert!(matches!(args.into_config(), Err(Error::Config(_))));
    }

    #[test]
    fn zero_workers_means_one_per_cpu() {
        let args = Args::try_parse_from(["portico"]).unwrap();
        assert!(args.into_config().unwrap().workers >= 1);
    }
}
