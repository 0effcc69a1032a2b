//! Session log records
//!
//! One [`LogEntry`] becomes one line in a session's `.jsonl` file and one
//! value in a remote push. Entries are built by the proxy engine and the
//! session manager and are immutable once handed to the sink.

use crate::providers::{Provider, Transport};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use http::HeaderMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::value::RawValue;
use serde_json::Value;
use std::collections::BTreeMap;

/// Header name to value, names lowercased, repeated values joined by `, `
pub type LoggedHeaders = BTreeMap<String, String>;

/// A tagged session log record
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub machine_id: String,
    pub session_id: String,
    pub seq: u64,
    pub upstream_host: String,
    /// Absent only on rejected requests whose provider segment is unknown
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
    pub transport: Transport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub kind: LogEntryKind,
}

fn serialize_timestamp<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Nanos, true))
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEntryKind {
    SessionStart(SessionStartRecord),
    Request(RequestRecord),
    Response(ResponseRecord),
    Fork(ForkRecord),
}

impl LogEntryKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionStart(_) => "session_start",
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Fork(_) => "fork",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStartRecord {
    pub client_session_id: String,
    pub fingerprint_head: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForkRecord {
    pub client_session_id: String,
    pub parent_id: String,
    pub child_id: String,
    pub parent_fingerprint_head: String,
    pub fingerprint_head: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub method: String,
    pub url: String,
    pub headers: LoggedHeaders,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<LoggedBody>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub rejected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseRecord {
    pub status: u16,
    pub duration_ms: u64,
    pub headers: LoggedHeaders,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<LoggedBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<StreamEvent>>,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One event of a streamed response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    pub data: Value,
}

impl StreamEvent {
    pub fn new(event: Option<String>, data: Value) -> Self {
        Self { event, data }
    }
}

/// A request or response body as logged.
///
/// JSON bodies are embedded as JSON (byte-for-byte when they are already a
/// single line), other UTF-8 as a string, anything else as base64.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum LoggedBody {
    Json(Box<RawValue>),
    Text(String),
    Binary { base64: String },
}

impl LoggedBody {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() {
            return None;
        }

        let single_line = !bytes.iter().any(|b| *b == b'\n' || *b == b'\r');
        if single_line {
            if let Ok(raw) = serde_json::from_slice::<Box<RawValue>>(bytes) {
                return Some(Self::Json(raw));
            }
        } else if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
            if let Ok(raw) = serde_json::value::to_raw_value(&value) {
                return Some(Self::Json(raw));
            }
        }

        match std::str::from_utf8(bytes) {
            Ok(text) => Some(Self::Text(text.to_string())),
            Err(_) => Some(Self::Binary {
                base64: BASE64.encode(bytes),
            }),
        }
    }
}

/// Convert an HTTP header map into its logged form
pub fn logged_headers(headers: &HeaderMap) -> LoggedHeaders {
    let mut logged = LoggedHeaders::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        logged
            .entry(name.as_str().to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    logged
}

/// Fields shared by every entry of one request
#[derive(Debug, Clone)]
pub struct EntryContext {
    pub machine_id: String,
    pub session_id: String,
    pub upstream_host: String,
    pub provider: Option<Provider>,
    pub transport: Transport,
    pub request_id: Option<String>,
}

impl EntryContext {
    pub fn entry(&self, seq: u64, kind: LogEntryKind) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            machine_id: self.machine_id.clone(),
            session_id: self.session_id.clone(),
            seq,
            upstream_host: self.upstream_host.clone(),
            provider: self.provider,
            transport: self.transport,
            request_id: self.request_id.clone(),
            kind,
        }
    }

    pub fn for_session(&self, session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..self.clone()
        }
    }
}

impl LogEntry {
    /// Headers carried by request and response entries
    pub fn headers_mut(&mut self) -> Option<&mut LoggedHeaders> {
        match &mut self.kind {
            LogEntryKind::Request(r) => Some(&mut r.headers),
            LogEntryKind::Response(r) => Some(&mut r.headers),
            _ => None,
        }
    }
}
