//! Type definitions for the proxy module

use crate::providers::bedrock::auth::SigningError;
use crate::proxy::route::RouteError;
use http::HeaderValue;
use nutype::nutype;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Default limit on inbound request bodies
pub const DEFAULT_MAX_REQUEST_BODY: usize = 32 * 1024 * 1024;

/// DNS name of an upstream, as taken from the second path segment
#[nutype(
    sanitize(lowercase),
    validate(
        not_empty,
        len_char_max = 253,
        predicate = |host: &str| {
            !host.starts_with('.')
                && !host.contains("..")
                && host.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        }
    ),
    derive(Debug, Clone, PartialEq, Eq, Hash, Display, AsRef, Serialize, Deserialize)
)]
pub struct UpstreamHost(String);

/// Correlation id carried on every request and its log entries
#[nutype(derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize, AsRef))]
pub struct RequestId(Uuid);

impl RequestId {
    /// A new time-ordered id
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }

    /// Keep a well-formed id supplied by the client, otherwise generate one
    pub fn from_header(value: Option<&HeaderValue>) -> Self {
        value
            .and_then(|value| value.to_str().ok())
            .and_then(|value| Uuid::parse_str(value.trim()).ok())
            .map(Self::new)
            .unwrap_or_else(Self::generate)
    }
}

/// Proxy engine configuration
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// Stable host identifier written on every entry
    pub machine_id: String,
    /// Maximum inbound request body in bytes
    pub max_request_body: usize,
    /// End a response whose upstream stays silent this long
    pub idle_read_timeout: Option<Duration>,
    /// Upstream host to base URL (scheme, authority, optional path prefix)
    pub upstream_overrides: HashMap<String, String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            machine_id: "localhost".to_string(),
            max_request_body: DEFAULT_MAX_REQUEST_BODY,
            idle_read_timeout: None,
            upstream_overrides: HashMap::new(),
        }
    }
}

/// Errors that can occur in the proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Malformed proxy route: {0}")]
    MalformedRoute(#[from] RouteError),

    #[error("Request body exceeds {limit} bytes")]
    RequestTooLarge { limit: usize },

    #[error("Failed to read request body: {0}")]
    BodyRead(String),

    #[error("Failed to connect to upstream: {0}")]
    UpstreamDial(String),

    #[error("Upstream I/O error: {0}")]
    UpstreamIo(String),

    #[error("Upstream timed out: {0}")]
    UpstreamTimeout(String),

    #[error("Bedrock request signing failed: {0}")]
    Signing(#[from] SigningError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Classify a transport error from the upstream client
    pub fn from_upstream(error: &reqwest::Error) -> Self {
        let message = error_chain(error);
        if error.is_timeout() {
            Self::UpstreamTimeout(message)
        } else if error.is_connect() {
            Self::UpstreamDial(message)
        } else {
            Self::UpstreamIo(message)
        }
    }
}

/// `error: source: source...` on one line
pub fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("api.anthropic.com", true)]
    #[case("API.OpenAI.com", true)]
    #[case("bedrock-runtime.us-west-2.amazonaws.com", true)]
    #[case("localhost", true)]
    #[case("", false)]
    #[case("..", false)]
    #[case(".hidden", false)]
    #[case("a..b", false)]
    #[case("host:8080", false)]
    #[case("host/path", false)]
    #[case("host name", false)]
    fn test_upstream_host_validation(#[case] host: &str, #[case] valid: bool) {
        assert_eq!(UpstreamHost::try_new(host.to_string()).is_ok(), valid);
    }

    #[test]
    fn test_upstream_host_is_lowercased() {
        let host = UpstreamHost::try_new("API.OpenAI.com".to_string()).unwrap();
        assert_eq!(host.as_ref(), "api.openai.com");
    }

    #[test]
    fn test_request_id_keeps_client_uuid() {
        let client = "0190a5b2-7c1e-7abc-8def-0123456789ab";
        let header = HeaderValue::from_static(client);
        assert_eq!(RequestId::from_header(Some(&header)).to_string(), client);
    }

    #[rstest]
    #[case(None)]
    #[case(Some("not-a-uuid"))]
    fn test_request_id_is_generated(#[case] header: Option<&'static str>) {
        let header = header.map(HeaderValue::from_static);
        let id = RequestId::from_header(header.as_ref());
        assert_eq!(id.as_ref().get_version_num(), 7);
    }

    #[test]
    fn test_default_body_limit() {
        assert_eq!(ProxyConfig::default().max_request_body, 32 * 1024 * 1024);
    }
}
