//! Constants for provider interactions
//!
//! This module centralizes string literals, JSON field names, and other
//! constants used across provider handling.

/// JSON field names read from request bodies
pub mod json_fields {
    pub const MESSAGES: &str = "messages";
    pub const INPUT: &str = "input";
    pub const ROLE: &str = "role";
    pub const CONTENT: &str = "content";
    pub const TYPE: &str = "type";
    pub const TEXT: &str = "text";

    /// Content part types that carry plain text
    pub const TEXT_PART_TYPES: &[&str] = &["text", "input_text", "output_text"];

    /// Bedrock eventstream chunk payload field holding base64 data
    pub const BYTES: &str = "bytes";
}

/// Path constants for routing and URL manipulation
pub mod paths {
    /// Bedrock API path components
    pub mod bedrock {
        pub const MODEL_SEGMENT: &str = "model";
        pub const INVOKE_ENDPOINT: &str = "invoke";
        pub const INVOKE_STREAM_ENDPOINT: &str = "invoke-with-response-stream";
    }

    /// ChatGPT backend path components
    pub mod chatgpt {
        pub const UPSTREAM_HOST: &str = "chatgpt.com";
        pub const CODEX_BASE_PATH: &str = "/backend-api/codex";
        pub const OPENAI_VERSION_PREFIX: &str = "/v1";
    }
}

/// HTTP-related constants
pub mod http {
    /// Content type constants
    pub mod content_types {
        pub const APPLICATION_JSON: &str = "application/json";
        pub const TEXT_EVENT_STREAM: &str = "text/event-stream";
        pub const AMAZON_EVENTSTREAM: &str = "application/vnd.amazon.eventstream";
    }

    /// Header names specific to providers
    pub mod headers {
        /// AWS-specific headers
        pub mod aws {
            pub const AMZ_PREFIX: &str = "x-amz-";
            pub const AMZ_DATE: &str = "x-amz-date";
            pub const AMZ_SECURITY_TOKEN: &str = "x-amz-security-token";
            pub const AMZ_CONTENT_SHA256: &str = "x-amz-content-sha256";
        }
    }
}

/// SQL constants for database operations
pub mod sql {
    pub const HEALTH_CHECK_QUERY: &str = "SELECT 1 as health_check";
    pub const HEALTH_CHECK_COLUMN: &str = "health_check";
    pub const HEALTH_CHECK_EXPECTED_VALUE: i32 = 1;
}

/// AWS Bedrock service constants
pub mod bedrock {
    pub const SIGNING_NAME: &str = "bedrock";
    pub const DEFAULT_REGION: &str = "us-east-1";

    /// Build the runtime host for a region
    pub fn runtime_host(region: &str) -> String {
        format!("bedrock-runtime.{region}.amazonaws.com")
    }

    /// Refresh cached credentials when they expire within this window
    pub const CREDENTIAL_REFRESH_WINDOW_SECS: u64 = 300;
}
