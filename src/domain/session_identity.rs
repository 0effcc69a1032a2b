//! Client session identity
//!
//! Clients don't send an explicit session header; their conversation id is
//! buried in provider-specific body fields. Which fields are searched is
//! configuration with a default per provider.

use crate::providers::Provider;
use serde_json::Value;
use std::collections::HashMap;

/// Client id used when no configured path yields a value
pub const DEFAULT_CLIENT_SESSION_ID: &str = "default";

/// Ordered dotted JSON paths searched for the client session id
#[derive(Debug, Clone, Default)]
pub struct SessionIdPaths {
    overrides: HashMap<Provider, Vec<String>>,
}

impl SessionIdPaths {
    /// Build from configuration keyed by provider name. Unknown provider
    /// names are returned so the caller can warn about them.
    pub fn from_config(config: &HashMap<String, Vec<String>>) -> (Self, Vec<String>) {
        let mut overrides = HashMap::new();
        let mut unknown = Vec::new();
        for (key, paths) in config {
            match Provider::from_config_key(key) {
                Some(provider) => {
                    overrides.insert(provider, paths.clone());
                }
                None => unknown.push(key.clone()),
            }
        }
        (Self { overrides }, unknown)
    }

    pub fn paths_for(&self, provider: Provider) -> Vec<&str> {
        match self.overrides.get(&provider) {
            Some(paths) => paths.iter().map(String::as_str).collect(),
            None => provider.default_session_id_paths().to_vec(),
        }
    }

    /// First non-empty value found along the provider's paths
    pub fn extract(&self, provider: Provider, body: &Value) -> Option<String> {
        self.paths_for(provider)
            .into_iter()
            .find_map(|path| lookup(body, path))
    }
}

fn lookup(body: &Value, path: &str) -> Option<String> {
    let value = path
        .split('.')
        .try_fold(body, |current, segment| current.get(segment))?;
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
