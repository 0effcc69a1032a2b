//! Bedrock health reporting

use crate::providers::bedrock::types::AwsRegion;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared Bedrock state surfaced on `/health/bedrock`
#[derive(Debug)]
pub struct BedrockHealth {
    region: Option<AwsRegion>,
    signer_ready: bool,
    decode_errors: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BedrockHealthReport {
    pub status: &'static str,
    pub region: Option<String>,
    pub decode_errors: u64,
}

impl BedrockHealth {
    pub fn new(region: Option<AwsRegion>, signer_ready: bool) -> Self {
        Self {
            region,
            signer_ready,
            decode_errors: AtomicU64::new(0),
        }
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn report(&self) -> BedrockHealthReport {
        BedrockHealthReport {
            status: if self.signer_ready { "ok" } else { "unconfigured" },
            region: self.region.as_ref().map(|r| r.as_ref().to_string()),
            decode_errors: self.decode_errors(),
        }
    }
}
