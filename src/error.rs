//! Unified error type.

use std::time::Duration;

/// The error type returned by portico's fallible operations.
///
/// Upstream HTTP statuses (404, 422, etc.) are not errors: they are forwarded
/// to the client untouched. This type surfaces infrastructure failures only:
/// binding a port, reaching an origin, or a configuration that cannot work.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("no origin named `{0}`")]
    UnknownOrigin(String),

    #[error("connect to {origin} failed: {source}")]
    Connect {
        origin: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection pool for `{0}` is saturated")]
    Saturated(String),

    #[error("upstream: {0}")]
    Upstream(#[from] hyper::Error),

    #[error("request: {0}")]
    Request(#[from] http::Error),
}

impl Error {
    /// Whether the failure means the origin could not be used at all, as
    /// opposed to the gateway building a bad request.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::Timeout(_) | Self::Saturated(_) | Self::Upstream(_)
        )
    }
}
