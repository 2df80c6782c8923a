//! Prefix route classifier.
//!
//! Decides, for a request path, which origin owns it, whether its response
//! may be micro-cached, and which response-header policy applies. The table
//! is built once at startup. Changing it requires a restart.

use std::fmt;
use std::str::FromStr;

use crate::config::{GatewayConfig, RouteRule};
use crate::error::Error;

/// How responses on a route are cached, by the gateway and downstream.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CachePolicy {
    /// Forward untouched, never cached. Session-bearing routes.
    Passthrough,
    /// Short-TTL micro-cache for successful GETs.
    Micro,
    /// Static build output: long-lived `cache-control` chosen per asset class.
    Static,
}

impl CachePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passthrough => "passthrough",
            Self::Micro       => "micro",
            Self::Static      => "static",
        }
    }
}

impl FromStr for CachePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "passthrough" | "none" => Ok(Self::Passthrough),
            "micro" | "short"      => Ok(Self::Micro),
            "static" | "long"      => Ok(Self::Static),
            _ => Err(Error::Config(format!("unknown cache policy `{s}`"))),
        }
    }
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of static content, derived from the request path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AssetClass {
    /// Content-hashed build output. Safe to cache forever.
    Immutable,
    /// Any other file with an extension.
    Asset,
    /// HTML pages and extension-less SPA routes.
    Document,
}

impl AssetClass {
    pub fn of(path: &str) -> Self {
        if path.starts_with("/_next/static/") {
            return Self::Immutable;
        }
        let file = path.rsplit('/').next().unwrap_or_default();
        let Some((stem, ext)) = file.rsplit_once('.') else {
            return Self::Document;
        };
        if stem.is_empty() || ext.eq_ignore_ascii_case("html") || ext.eq_ignore_ascii_case("htm") {
            return Self::Document;
        }
        let hashed = stem.split(['.', '-', '_'])
            .any(|part| part.len() >= 8 && part.bytes().all(|b| b.is_ascii_hexdigit()));
        if hashed { Self::Immutable } else { Self::Asset }
    }
}

/// The classifier's verdict for one request.
#[derive(Clone, Copy, Debug)]
pub struct Route<'a> {
    pub rule: &'a RouteRule,
    pub asset: AssetClass,
}

impl Route<'_> {
    pub fn origin(&self) -> &str { &self.rule.origin }
    pub fn policy(&self) -> CachePolicy { self.rule.policy }
}

/// The gateway's routing table.
///
/// Rules are kept sorted by prefix length, longest first, so the most
/// specific prefix wins. The sort is stable: two rules with the same prefix
/// keep their configuration order and the first one wins. A prefix matches
/// on segment boundaries only, so `/api` owns `/api` and `/api/stats` but
/// not `/apidocs`. Paths no rule matches go to the fallback rule.
pub struct Router {
    rules: Vec<RouteRule>,
    fallback: RouteRule,
}

impl Router {
    pub fn new(rules: Vec<RouteRule>, fallback: RouteRule) -> Self {
        let mut rules = rules;
        rules.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { rules, fallback }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(config.routes.clone(), config.fallback.clone())
    }

    pub fn classify(&self, path: &str) -> Route<'_> {
        let rule = self.rules.iter()
            .find(|rule| prefix_matches(&rule.prefix, path))
            .unwrap_or(&self.fallback);
        Route { rule, asset: AssetClass::of(path) }
    }

    pub fn rules(&self) -> &[RouteRule] { &self.rules }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(rules: &[(&str, &str, CachePolicy)]) -> Router {
        let rules = rules.iter().map(|(p, o, c)| RouteRule::new(p, o, *c)).collect();
        Router::new(rules, GatewayConfig::default_fallback())
    }

    #[test]
    fn api_and_admin_go_to_the_api_origin() {
        let router = Router::from_config(&GatewayConfig::default());

        let api = router.classify("/api/stats");
        assert_eq!(api.origin(), "api");
        assert_eq!(api.policy(), CachePolicy::Micro);

        let admin = router.classify("/admin/login");
        assert_eq!(admin.origin(), "api");
        assert_eq!(admin.policy(), CachePolicy::Passthrough);
    }

    #[test]
    fn unmatched_paths_fall_through_to_the_spa() {
        let router = Router::from_config(&GatewayConfig::default());
        let route = router.classify("/nonexistent/path");
        assert_eq!(route.origin(), "spa");
        assert_eq!(route.policy(), CachePolicy::Static);
        assert!(route.rule.relax_csp);
    }

    #[test]
    fn prefixes_match_whole_segments() {
        let router = router(&[("/api", "api", CachePolicy::Micro)]);
        assert_eq!(router.classify("/api").origin(), "api");
        assert_eq!(router.classify("/api/").origin(), "api");
        assert_eq!(router.classify("/apidocs").origin(), "spa");
    }

    #[test]
    fn longest_prefix_wins_regardless_of_order() {
        let router = router(&[
            ("/api", "api", CachePolicy::Micro),
            ("/api/stream", "media", CachePolicy::Passthrough),
        ]);
        assert_eq!(router.classify("/api/stream/1").origin(), "media");
        assert_eq!(router.classify("/api/streams").origin(), "api");
    }

    #[test]
    fn first_rule_wins_among_equal_prefixes() {
        let router = router(&[
            ("/files", "api", CachePolicy::Static),
            ("/files", "spa", CachePolicy::Passthrough),
        ]);
        assert_eq!(router.classify("/files/a.txt").origin(), "api");
    }

    #[test]
    fn asset_classes() {
        assert_eq!(AssetClass::of("/_next/static/chunks/app.js"), AssetClass::Immutable);
        assert_eq!(AssetClass::of("/assets/main.3f2a9c1b.js"), AssetClass::Immutable);
        assert_eq!(AssetClass::of("/assets/chunk-4f3e2a1b9c.css"), AssetClass::Immutable);
        assert_eq!(AssetClass::of("/favicon.ico"), AssetClass::Asset);
        assert_eq!(AssetClass::of("/logo-pertamina.png"), AssetClass::Asset);
        assert_eq!(AssetClass::of("/playlist/3/7"), AssetClass::Document);
        assert_eq!(AssetClass::of("/index.html"), AssetClass::Document);
        assert_eq!(AssetClass::of("/"), AssetClass::Document);
    }
}
