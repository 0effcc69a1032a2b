//! Header redaction for logged entries

use crate::domain::log_entry::LoggedHeaders;
use std::collections::HashSet;

/// Headers that are always redacted
pub const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "x-api-key",
    "cookie",
    "set-cookie",
    "proxy-authorization",
];

const VISIBLE_PREFIX_CHARS: usize = 4;

/// Masks the values of sensitive headers
#[derive(Debug, Clone)]
pub struct Redactor {
    names: HashSet<String>,
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl Redactor {
    /// The fixed list plus `extra` names (case-insensitive)
    pub fn new(extra: &[String]) -> Self {
        let names = SENSITIVE_HEADERS
            .iter()
            .map(|name| name.to_string())
            .chain(extra.iter().map(|name| name.trim().to_ascii_lowercase()))
            .filter(|name| !name.is_empty())
            .collect();
        Self { names }
    }

    pub fn is_sensitive(&self, name: &str) -> bool {
        self.names.contains(&name.to_ascii_lowercase())
    }

    pub fn redact(&self, headers: &mut LoggedHeaders) {
        for (name, value) in headers.iter_mut() {
            if self.is_sensitive(name) {
                *value = redact_value(value);
            }
        }
    }
}

/// Keep at most 4 leading characters (never more than half the value)
pub fn redact_value(value: &str) -> String {
    let len = value.chars().count();
    let keep = VISIBLE_PREFIX_CHARS.min(len / 2);
    let prefix: String = value.chars().take(keep).collect();
    format!("{prefix}…redacted(len={len})")
}
