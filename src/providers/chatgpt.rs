//! ChatGPT session-token detection
//!
//! Codex-style clients talk to the OpenAI-compatible URL but authenticate
//! with a ChatGPT OAuth access token. Those requests have to go to the
//! ChatGPT backend instead of the OpenAI API.

use crate::providers::constants::paths::chatgpt::{CODEX_BASE_PATH, OPENAI_VERSION_PREFIX};
use http::{header::AUTHORIZATION, HeaderMap};

/// Token prefixes recognised as ChatGPT session tokens.
///
/// ChatGPT access tokens are JWTs, whose base64url header always starts with
/// `eyJ` (`{"`). OpenAI API keys start with `sk-` and never match.
pub const CHATGPT_TOKEN_PREFIXES: &[&str] = &["eyJ"];

const BEARER_PREFIX: &str = "Bearer ";

/// Whether the request carries a ChatGPT bearer token
pub fn is_chatgpt_token(headers: &HeaderMap) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix(BEARER_PREFIX))
        .map(str::trim)
        .is_some_and(|token| {
            CHATGPT_TOKEN_PREFIXES
                .iter()
                .any(|prefix| token.starts_with(prefix))
        })
}

/// Map an OpenAI-style path onto the Codex backend.
///
/// `/v1/responses?x=1` becomes `/backend-api/codex/responses?x=1`.
pub fn codex_path(upstream_path: &str) -> String {
    let rest = match upstream_path.strip_prefix(OPENAI_VERSION_PREFIX) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') || rest.starts_with('?') => rest,
        _ => upstream_path,
    };
    if rest.is_empty() || rest == "/" {
        CODEX_BASE_PATH.to_string()
    } else if rest.starts_with('/') || rest.starts_with('?') {
        format!("{CODEX_BASE_PATH}{rest}")
    } else {
        format!("{CODEX_BASE_PATH}/{rest}")
    }
}
