//! Decoding `/<provider>/<upstream-host>/<path>` into a route

use crate::providers::bedrock::models::{extract_model_id, ModelIdError};
use crate::providers::bedrock::types::ModelId;
use crate::providers::chatgpt::{codex_path, is_chatgpt_token};
use crate::providers::constants::paths::chatgpt::UPSTREAM_HOST as CHATGPT_HOST;
use crate::providers::Provider;
use crate::proxy::types::UpstreamHost;
use http::{HeaderMap, Uri};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("missing provider segment")]
    MissingProvider,

    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("missing upstream host segment")]
    MissingHost,

    #[error("invalid upstream host '{0}'")]
    InvalidHost(String),

    #[error("invalid Bedrock model id: {0}")]
    ModelId(#[from] ModelIdError),
}

/// Where an inbound request goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRoute {
    pub provider: Provider,
    pub upstream_host: UpstreamHost,
    /// Path on the upstream, starting with `/`, query string retained
    pub upstream_path: String,
    /// Bedrock only
    pub model_id: Option<ModelId>,
}

impl ProxyRoute {
    /// Decode the route of an inbound request. A ChatGPT bearer token sends
    /// an OpenAI-style request to the ChatGPT backend whatever the URL says.
    pub fn parse(uri: &Uri, headers: &HeaderMap) -> Result<Self, RouteError> {
        let path = uri.path().trim_start_matches('/');
        let mut segments = path.splitn(3, '/');

        let provider_segment = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or(RouteError::MissingProvider)?;
        let provider = Provider::from_path_segment(provider_segment)
            .ok_or_else(|| RouteError::UnknownProvider(provider_segment.to_string()))?;

        let host_segment = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or(RouteError::MissingHost)?;
        let upstream_host = UpstreamHost::try_new(host_segment.to_string())
            .map_err(|_| RouteError::InvalidHost(host_segment.to_string()))?;

        let mut upstream_path = format!("/{}", segments.next().unwrap_or_default());
        if let Some(query) = uri.query() {
            upstream_path.push('?');
            upstream_path.push_str(query);
        }

        if provider == Provider::Bedrock {
            let model_id = extract_model_id(&upstream_path)?;
            return Ok(Self {
                provider,
                upstream_host,
                upstream_path,
                model_id: Some(model_id),
            });
        }

        if is_chatgpt_token(headers) {
            let chatgpt_host = UpstreamHost::try_new(CHATGPT_HOST.to_string())
                .map_err(|_| RouteError::InvalidHost(CHATGPT_HOST.to_string()))?;
            return Ok(Self {
                provider: Provider::ChatGpt,
                upstream_host: chatgpt_host,
                upstream_path: codex_path(&upstream_path),
                model_id: None,
            });
        }

        Ok(Self {
            provider,
            upstream_host,
            upstream_path,
            model_id: None,
        })
    }

    /// Provider named by the first path segment, when recognisable
    pub fn provider_hint(uri: &Uri) -> Option<Provider> {
        uri.path()
            .trim_start_matches('/')
            .split('/')
            .next()
            .and_then(Provider::from_path_segment)
    }
}
