//! HTTP header constants and utilities for the proxy service
//!
//! Headers pass through in both directions except the hop-by-hop set, any
//! header named by `Connection`, and the ones the proxy owns (`Host`,
//! `Content-Length`).

use ::http::header::{self, HeaderMap, HeaderName, HeaderValue};

/// Header name for request ID used for tracing and correlation
pub const X_REQUEST_ID: &str = "x-request-id";

/// Standard header re-exports for convenience
pub use header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HOST};

/// Connection-scoped headers that are never forwarded
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Well-known paths
pub mod paths {
    /// Health check endpoint path
    pub const HEALTH: &str = "/health";

    /// Bedrock signer and decoder health
    pub const HEALTH_BEDROCK: &str = "/health/bedrock";

    /// Remote exporter counters
    pub const HEALTH_LOKI: &str = "/health/loki";
}

/// Common content types (re-exported from centralized constants)
pub mod content_types {
    pub use crate::providers::constants::http::content_types::*;
}

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Copy of `headers` without hop-by-hop headers or those listed in
/// `Connection`
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let connection_listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name) || connection_listed.iter().any(|listed| listed == name.as_str()) {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

/// Headers sent upstream: the client's, filtered, with `Host` set to
/// `authority`
pub fn upstream_request_headers(client: &HeaderMap, authority: &str) -> HeaderMap {
    let mut headers = strip_hop_by_hop(client);
    headers.remove(HOST);
    headers.remove(CONTENT_LENGTH);
    if let Ok(host) = HeaderValue::from_str(authority) {
        headers.insert(HOST, host);
    }
    headers
}

/// Headers returned to the client. Streamed bodies are re-framed by the
/// server, so their `Content-Length` is dropped.
pub fn client_response_headers(upstream: &HeaderMap, streamed: bool) -> HeaderMap {
    let mut headers = strip_hop_by_hop(upstream);
    if streamed {
        headers.remove(CONTENT_LENGTH);
    }
    headers
}
