//! AWS Bedrock upstream selection and signing

use crate::providers::bedrock::auth::{SigV4Signer, SigningError};
use crate::providers::bedrock::health::BedrockHealth;
use crate::providers::bedrock::types::AwsRegion;
use crate::providers::constants::bedrock::{runtime_host, DEFAULT_REGION};
use http::{HeaderMap, Method};
use std::sync::Arc;

/// AWS Bedrock provider
pub struct BedrockProvider {
    region: Option<AwsRegion>,
    base_url: Option<String>,
    signer: Option<SigV4Signer>,
    health: Arc<BedrockHealth>,
}

impl BedrockProvider {
    /// Create a new Bedrock provider.
    ///
    /// Without a configured region the region is read from the upstream
    /// host of each request (`bedrock-runtime.<region>.amazonaws.com`).
    pub fn new(region: Option<AwsRegion>, signer: Option<SigV4Signer>) -> Self {
        let health = Arc::new(BedrockHealth::new(region.clone(), signer.is_some()));
        Self {
            region,
            base_url: None,
            signer,
            health,
        }
    }

    /// Send every Bedrock request to `base_url` instead of the regional host
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    pub fn health(&self) -> Arc<BedrockHealth> {
        Arc::clone(&self.health)
    }

    /// Region used for a request addressed to `upstream_host`
    pub fn region_for(&self, upstream_host: &str) -> Result<AwsRegion, SigningError> {
        if let Some(region) = &self.region {
            return Ok(region.clone());
        }
        let from_host = upstream_host
            .strip_prefix("bedrock-runtime.")
            .and_then(|rest| rest.strip_suffix(".amazonaws.com"))
            .unwrap_or(DEFAULT_REGION);
        AwsRegion::try_new(from_host.to_string())
            .map_err(|e| SigningError::Params(format!("invalid region {from_host}: {e}")))
    }

    /// Build the target URL for Bedrock API
    pub fn target_url(
        &self,
        upstream_host: &str,
        upstream_path: &str,
    ) -> Result<String, SigningError> {
        match &self.base_url {
            Some(base) => Ok(format!("{base}{upstream_path}")),
            None => {
                let region = self.region_for(upstream_host)?;
                Ok(format!(
                    "https://{}{upstream_path}",
                    runtime_host(region.as_ref())
                ))
            }
        }
    }

    pub async fn sign(
        &self,
        region: &AwsRegion,
        method: &Method,
        url: &str,
        headers: &mut HeaderMap,
        body: &[u8],
    ) -> Result<(), SigningError> {
        let signer = self.signer.as_ref().ok_or_else(|| {
            SigningError::Credentials("Bedrock signing is not configured".to_string())
        })?;
        signer.sign(region, method, url, headers, body).await
    }
}
