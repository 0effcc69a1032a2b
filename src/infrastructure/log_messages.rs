//! Log message constants for infrastructure components
//!
//! Messages are paired with structured `tracing` fields at the call site
//! and carry no placeholders.

/// Application startup and lifecycle messages
pub mod application {
    pub const STARTING: &str = "Starting llm-proxy";
    pub const LISTENING: &str = "Proxy listening";
    pub const SHUTDOWN_SIGNAL: &str = "Shutdown signal received, draining connections";
    pub const STOPPED: &str = "llm-proxy stopped";
    pub const EXPORTER_DISABLED: &str = "Remote log export disabled (no loki.url)";
    pub const BEDROCK_UNCONFIGURED: &str = "Bedrock signing unavailable, requests will fail";
}

/// Database-related log messages
pub mod database {
    pub const OPENED: &str = "Session database opened";
    pub const UNAVAILABLE: &str = "Session database unavailable, request left untracked";
}

/// Session tagging messages
pub mod session {
    pub const STARTED: &str = "Started session";
    pub const FORKED: &str = "Forked session";
    pub const RESUMED: &str = "Resuming idle session";
    pub const UNKNOWN_PROVIDER_KEY: &str = "Ignoring session id paths for unknown provider";
}

/// Sink messages
pub mod sink {
    pub const WRITE_FAILED: &str = "Failed to write session log entry";
    pub const SERIALIZE_FAILED: &str = "Failed to serialize session log entry";
}

/// Remote export worker messages
pub mod exporter {
    pub const WORKER_STARTED: &str = "Log export worker started";
    pub const WORKER_STOPPED: &str = "Log export worker stopped";
    pub const BATCH_PUSHED: &str = "Pushed log batch";
    pub const PUSH_RETRY: &str = "Log push failed, retrying";
    pub const BATCH_DROPPED: &str = "Dropping log batch";
    pub const SHUTDOWN_ABANDONED: &str = "Log export did not drain before shutdown deadline";
}

/// Request/response processing messages
pub mod request_processing {
    pub const REJECTED: &str = "Rejected malformed proxy route";
    pub const UPSTREAM_FAILED: &str = "Upstream request failed";
    pub const SIGNING_FAILED: &str = "Bedrock request signing failed";
    pub const STREAM_TRUNCATED: &str = "Streamed response capture truncated";
    pub const BODY_TOO_LARGE: &str = "Request body exceeds limit";
}
