//! Header sanitizing and rewriting.

use std::net::SocketAddr;
use std::time::Duration;

use http::header::{HeaderName, HeaderValue};

use crate::headers::HeaderList;
use crate::router::{AssetClass, CachePolicy};

/// Hop-by-hop and transport headers never sent to an origin. `host` is
/// replaced with the origin's authority.
pub const OUTBOUND_STRIP: &[&str] = &[
    "host",
    "connection",
    "transfer-encoding",
    "expect",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
];

/// Headers an origin sends that the gateway owns on the client side.
pub const INBOUND_STRIP: &[&str] = &[
    "transfer-encoding",
    "connection",
    "keep-alive",
    "server",
    "date",
    "x-powered-by",
];

const MAX_AGE_IMMUTABLE: &str = "public, max-age=31536000, immutable";
const MAX_AGE_ASSET: &str = "public, max-age=86400";
const DOCUMENT: &str = "no-cache";

/// Strips hop-by-hop headers, including any the client named in its own
/// `connection` header.
pub fn sanitize_request(headers: &mut HeaderList) {
    let listed: Vec<String> = headers.get_all("connection")
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in &listed {
        headers.remove(name);
    }
    headers.remove_all(OUTBOUND_STRIP);
}

pub fn sanitize_response(headers: &mut HeaderList) {
    headers.remove_all(INBOUND_STRIP);
}

/// Adds `x-forwarded-for`, `x-forwarded-host` and `x-forwarded-proto`.
pub fn forwarded(headers: &mut HeaderList, peer: SocketAddr, client_host: Option<HeaderValue>) {
    let ip = peer.ip().to_string();
    let chain = match headers.get_str("x-forwarded-for") {
        Some(existing) => format!("{existing}, {ip}"),
        None => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&chain) {
        headers.set(HeaderName::from_static("x-forwarded-for"), value);
    }
    if let Some(host) = client_host {
        headers.set_if_absent(HeaderName::from_static("x-forwarded-host"), host);
    }
    headers.set_if_absent(HeaderName::from_static("x-forwarded-proto"), HeaderValue::from_static("http"));
}

/// The `cache-control` the gateway sets on a successful GET when the origin
/// sent none. Passthrough routes get nothing.
pub fn cache_control(policy: CachePolicy, asset: AssetClass, ttl: Duration) -> Option<HeaderValue> {
    match (policy, asset) {
        (CachePolicy::Passthrough, _)              => None,
        (CachePolicy::Micro, _)                    => HeaderValue::from_str(&micro_cache_control(ttl)).ok(),
        (CachePolicy::Static, AssetClass::Immutable) => Some(HeaderValue::from_static(MAX_AGE_IMMUTABLE)),
        (CachePolicy::Static, AssetClass::Asset)     => Some(HeaderValue::from_static(MAX_AGE_ASSET)),
        (CachePolicy::Static, AssetClass::Document)  => Some(HeaderValue::from_static(DOCUMENT)),
    }
}

/// `max-age` is whole seconds: sub-second TTLs round up to 1.
pub fn micro_cache_control(ttl: Duration) -> String {
    let secs = ttl.as_millis().div_ceil(1000).max(1);
    format!("public, max-age={secs}, stale-while-revalidate=10")
}

/// Rewrites every `content-security-policy` header so the page may connect
/// to `api_origin`. Each header is a separate policy and all of them apply,
/// so each is widened in place and none is dropped.
pub fn relax_csp_headers(headers: &mut HeaderList, api_origin: &str) {
    for value in headers.values_mut("content-security-policy") {
        let Ok(policy) = value.to_str() else { continue };
        let Some(relaxed) = relax_csp(policy, api_origin) else { continue };
        if let Ok(widened) = HeaderValue::from_str(&relaxed) {
            *value = widened;
        }
    }
}

/// Appends `api_origin` to `connect-src`. Without a `connect-src`, one is
/// derived from `default-src`. Returns `None` when nothing needs to change.
pub fn relax_csp(policy: &str, api_origin: &str) -> Option<String> {
    let mut directives: Vec<String> = policy.split(';')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_owned)
        .collect();

    let named = |directives: &[String], name: &str| {
        directives.iter().position(|d| {
            d.split_ascii_whitespace().next().is_some_and(|n| n.eq_ignore_ascii_case(name))
        })
    };
    let widened = |directive: &str| {
        let sources: Vec<&str> = directive.split_ascii_whitespace()
            .skip(1)
            .filter(|s| !s.eq_ignore_ascii_case("'none'"))
            .collect();
        let mut out = String::from("connect-src");
        for source in sources.iter().chain(std::iter::once(&api_origin)) {
            out.push(' ');
            out.push_str(source);
        }
        out
    };

    if let Some(i) = named(&directives, "connect-src") {
        let allowed = directives[i].split_ascii_whitespace().skip(1).any(|s| s == api_origin || s == "*");
        if allowed {
            return None;
        }
        directives[i] = widened(&directives[i]);
    } else if let Some(i) = named(&directives, "default-src") {
        let derived = widened(&directives[i]);
        directives.push(derived);
    } else {
        return None;
    }
    Some(directives.join("; "))
}
