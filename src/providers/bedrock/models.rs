//! Bedrock model-id extraction and validation

use crate::providers::bedrock::types::ModelId;
use crate::providers::constants::paths::bedrock::MODEL_SEGMENT;
use thiserror::Error;

/// Model-id prefixes accepted on the Bedrock route.
///
/// Vendor prefixes plus the cross-region inference-profile prefixes and
/// full ARNs (foundation models, inference profiles, provisioned models).
pub const KNOWN_MODEL_PREFIXES: &[&str] = &[
    "anthropic.",
    "amazon.",
    "meta.",
    "cohere.",
    "ai21.",
    "mistral.",
    "stability.",
    "deepseek.",
    "writer.",
    "us.",
    "eu.",
    "apac.",
    "global.",
    "arn:aws:bedrock:",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelIdError {
    #[error("missing /model/<id> segment")]
    Missing,

    #[error("model id is not valid percent-encoding: {0}")]
    Encoding(String),

    #[error("unknown model family: {0}")]
    UnknownFamily(String),
}

/// Extract the model ID from a Bedrock request path.
///
/// The id is the segment immediately following `/model/`, percent-decoded.
pub fn extract_model_id(path: &str) -> Result<ModelId, ModelIdError> {
    let path = path.split('?').next().unwrap_or(path);
    let parts: Vec<&str> = path.split('/').collect();

    let raw = parts
        .iter()
        .position(|&p| p == MODEL_SEGMENT)
        .and_then(|i| parts.get(i + 1))
        .filter(|s| !s.is_empty())
        .ok_or(ModelIdError::Missing)?;

    let decoded = urlencoding::decode(raw)
        .map_err(|e| ModelIdError::Encoding(e.to_string()))?
        .into_owned();

    validate_model_id(&decoded)?;
    ModelId::try_new(decoded).map_err(|_| ModelIdError::Missing)
}

pub fn validate_model_id(model_id: &str) -> Result<(), ModelIdError> {
    if KNOWN_MODEL_PREFIXES
        .iter()
        .any(|prefix| model_id.starts_with(prefix))
    {
        Ok(())
    } else {
        Err(ModelIdError::UnknownFamily(model_id.to_string()))
    }
}
