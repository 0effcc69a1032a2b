//! Provider identification and provider-specific behaviour
//!
//! The proxy is provider-agnostic on the wire: bodies are forwarded verbatim.
//! The only places where the provider matters are upstream selection,
//! request signing (Bedrock), session-id extraction, and how streamed
//! responses are decoded for logging.

pub mod bedrock;
pub mod chatgpt;
pub mod constants;

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// LLM provider a request is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[display("anthropic")]
    Anthropic,
    #[display("openai")]
    OpenAi,
    #[display("chatgpt")]
    ChatGpt,
    #[display("bedrock")]
    Bedrock,
}

impl Provider {
    /// Parse the provider named by the first URL path segment.
    ///
    /// `chatgpt` is not routable by URL; it is only selected from the
    /// bearer token (see [`chatgpt::is_chatgpt_token`]).
    pub fn from_path_segment(segment: &str) -> Option<Self> {
        match segment.to_ascii_lowercase().as_str() {
            "anthropic" => Some(Self::Anthropic),
            "openai" => Some(Self::OpenAi),
            "bedrock" => Some(Self::Bedrock),
            _ => None,
        }
    }

    /// Parse a provider name as used in configuration keys
    pub fn from_config_key(key: &str) -> Option<Self> {
        match key.to_ascii_lowercase().as_str() {
            "chatgpt" => Some(Self::ChatGpt),
            other => Self::from_path_segment(other),
        }
    }

    pub fn transport(&self) -> Transport {
        match self {
            Self::Bedrock => Transport::Bedrock,
            _ => Transport::Http,
        }
    }

    /// Dotted JSON paths searched for the client session id when no
    /// override is configured
    pub fn default_session_id_paths(&self) -> &'static [&'static str] {
        match self {
            Self::Anthropic | Self::Bedrock => &["metadata.user_id"],
            Self::OpenAi => &["user", "metadata.user_id"],
            Self::ChatGpt => &["prompt_cache_key", "metadata.user_id"],
        }
    }

    pub fn all() -> [Provider; 4] {
        [Self::Anthropic, Self::OpenAi, Self::ChatGpt, Self::Bedrock]
    }
}

/// Wire transport used to reach the upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[display("http")]
    Http,
    #[display("bedrock")]
    Bedrock,
}
