//! Type definitions for AWS Bedrock routing

use nutype::nutype;

/// AWS region for Bedrock
#[nutype(
    sanitize(trim, lowercase),
    validate(not_empty, regex = r"^[a-z]{2}(-gov)?-[a-z]+-\d{1}$"),
    derive(Debug, Clone, PartialEq, Eq, Display, Serialize, Deserialize, AsRef)
)]
pub struct AwsRegion(String);

/// Model ID as used by Bedrock, already percent-decoded
#[nutype(
    sanitize(trim),
    validate(not_empty),
    derive(Debug, Clone, PartialEq, Eq, Display, Serialize, Deserialize, AsRef)
)]
pub struct ModelId(String);

/// Bedrock endpoint types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BedrockEndpoint {
    InvokeModel,
    InvokeModelWithResponseStream,
    Converse,
    ConverseStream,
}

impl BedrockEndpoint {
    /// Parse endpoint from path
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.split('?').next().unwrap_or(path);
        if path.ends_with("/invoke") {
            Some(Self::InvokeModel)
        } else if path.ends_with("/invoke-with-response-stream") {
            Some(Self::InvokeModelWithResponseStream)
        } else if path.ends_with("/converse") {
            Some(Self::Converse)
        } else if path.ends_with("/converse-stream") {
            Some(Self::ConverseStream)
        } else {
            None
        }
    }

    /// Get the endpoint suffix
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::InvokeModel => "invoke",
            Self::InvokeModelWithResponseStream => "invoke-with-response-stream",
            Self::Converse => "converse",
            Self::ConverseStream => "converse-stream",
        }
    }

    /// Whether the endpoint answers with a binary eventstream
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::InvokeModelWithResponseStream | Self::ConverseStream)
    }
}
