//! AWS SigV4 signing for Bedrock
//!
//! Clients talk to the proxy without AWS credentials of their own; the proxy
//! strips whatever signing headers the client sent and signs the outbound
//! request with credentials resolved from the ambient AWS chain.

use crate::providers::bedrock::types::AwsRegion;
use crate::providers::constants::bedrock::{CREDENTIAL_REFRESH_WINDOW_SECS, SIGNING_NAME};
use crate::providers::constants::http::headers::aws::AMZ_PREFIX;
use async_trait::async_trait;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_credential_types::Credentials;
use aws_sigv4::http_request::{sign, SignableBody, SignableRequest, SigningSettings};
use aws_sigv4::sign::v4;
use aws_smithy_runtime_api::client::identity::Identity;
use http::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE, HOST};
use http::Method;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::debug;

/// Errors raised while signing a Bedrock request
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("no AWS credentials available: {0}")]
    Credentials(String),

    #[error("invalid signing parameters: {0}")]
    Params(String),

    #[error("request could not be signed: {0}")]
    Sign(String),

    #[error("signature produced an invalid header: {0}")]
    Header(String),
}

/// Source of AWS credentials for signing
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn credentials(&self) -> Result<Credentials, SigningError>;
}

/// Fixed credentials, used when keys are configured directly and in tests
pub struct StaticCredentialSource {
    credentials: Credentials,
}

impl StaticCredentialSource {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        Self {
            credentials: Credentials::new(
                access_key_id,
                secret_access_key,
                session_token,
                None,
                "llm-proxy-static",
            ),
        }
    }
}

#[async_trait]
impl CredentialSource for StaticCredentialSource {
    async fn credentials(&self) -> Result<Credentials, SigningError> {
        Ok(self.credentials.clone())
    }
}

/// Credentials from the default AWS provider chain (environment, profile
/// files, SSO, instance metadata), cached until close to expiry
pub struct ChainCredentialSource {
    provider: SharedCredentialsProvider,
    cached: tokio::sync::Mutex<Option<Credentials>>,
}

impl ChainCredentialSource {
    /// Resolve the default provider chain for a region
    pub async fn load(region: &AwsRegion) -> Result<Self, SigningError> {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.as_ref().to_string()))
            .load()
            .await;

        let provider = sdk_config.credentials_provider().ok_or_else(|| {
            SigningError::Credentials("no credentials provider in the default chain".to_string())
        })?;

        Ok(Self {
            provider,
            cached: tokio::sync::Mutex::new(None),
        })
    }
}

fn needs_refresh(credentials: &Credentials, now: SystemTime) -> bool {
    match credentials.expiry() {
        Some(expiry) => {
            expiry <= now + Duration::from_secs(CREDENTIAL_REFRESH_WINDOW_SECS)
        }
        None => false,
    }
}

#[async_trait]
impl CredentialSource for ChainCredentialSource {
    async fn credentials(&self) -> Result<Credentials, SigningError> {
        let mut cached = self.cached.lock().await;
        if let Some(credentials) = cached.as_ref() {
            if !needs_refresh(credentials, SystemTime::now()) {
                return Ok(credentials.clone());
            }
        }

        debug!("Refreshing AWS credentials from the default chain");
        let fresh = self
            .provider
            .provide_credentials()
            .await
            .map_err(|e| SigningError::Credentials(e.to_string()))?;
        *cached = Some(fresh.clone());
        Ok(fresh)
    }
}

/// Whether a header takes part in the signature
fn is_signed_header(name: &HeaderName) -> bool {
    name == HOST || name == CONTENT_TYPE || name.as_str().starts_with(AMZ_PREFIX)
}

/// Remove client-supplied authentication so it cannot leak upstream
pub fn strip_client_signing_headers(headers: &mut HeaderMap) {
    headers.remove(AUTHORIZATION);
    let amz: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with(AMZ_PREFIX))
        .cloned()
        .collect();
    for name in amz {
        headers.remove(name);
    }
}

/// SigV4 signer for the `bedrock` signing name
pub struct SigV4Signer {
    credentials: Box<dyn CredentialSource>,
}

impl SigV4Signer {
    pub fn new(credentials: impl CredentialSource + 'static) -> Self {
        Self {
            credentials: Box::new(credentials),
        }
    }

    /// Sign a request in place.
    ///
    /// `headers` must already carry the `Host` of `url`. The client's
    /// `authorization` and `x-amz-*` headers are replaced.
    pub async fn sign(
        &self,
        region: &AwsRegion,
        method: &Method,
        url: &str,
        headers: &mut HeaderMap,
        body: &[u8],
    ) -> Result<(), SigningError> {
        strip_client_signing_headers(headers);

        let credentials = self.credentials.credentials().await?;
        let identity: Identity = credentials.into();

        let signing_params = v4::SigningParams::builder()
            .identity(&identity)
            .region(region.as_ref())
            .name(SIGNING_NAME)
            .time(SystemTime::now())
            .settings(SigningSettings::default())
            .build()
            .map_err(|e| SigningError::Params(e.to_string()))?
            .into();

        let signed_headers: Vec<(String, String)> = headers
            .iter()
            .filter(|(name, _)| is_signed_header(name))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let signable = SignableRequest::new(
            method.as_str(),
            url,
            signed_headers
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str())),
            SignableBody::Bytes(body),
        )
        .map_err(|e| SigningError::Sign(e.to_string()))?;

        let (instructions, _signature) = sign(signable, &signing_params)
            .map_err(|e| SigningError::Sign(e.to_string()))?
            .into_parts();
        let (new_headers, _params) = instructions.into_parts();

        for header in new_headers {
            let name = HeaderName::from_bytes(header.name().as_bytes())
                .map_err(|e| SigningError::Header(e.to_string()))?;
            let value = HeaderValue::from_str(header.value())
                .map_err(|e| SigningError::Header(e.to_string()))?;
            headers.insert(name, value);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(name: &str) -> AwsRegion {
        AwsRegion::try_new(name.to_string()).unwrap()
    }

    fn request_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            HOST,
            HeaderValue::from_static("bedrock-runtime.us-west-2.amazonaws.com"),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }

    #[test]
    fn test_strip_client_signing_headers() {
        let mut headers = request_headers();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        headers.insert("x-amz-date", HeaderValue::from_static("20250126T120000Z"));
        headers.insert("x-amz-custom", HeaderValue::from_static("custom"));

        strip_client_signing_headers(&mut headers);

        assert!(!headers.contains_key(AUTHORIZATION));
        assert!(!headers.contains_key("x-amz-date"));
        assert!(!headers.contains_key("x-amz-custom"));
        assert!(headers.contains_key(CONTENT_TYPE));
    }

    #[tokio::test]
    async fn test_sign_adds_sigv4_headers_for_region() {
        let signer = SigV4Signer::new(StaticCredentialSource::new("AKIDEXAMPLE", "secret", None));
        let mut headers = request_headers();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer client-key"));

        signer
            .sign(
                &region("us-west-2"),
                &Method::POST,
                "https://bedrock-runtime.us-west-2.amazonaws.com/model/anthropic.claude-3/invoke",
                &mut headers,
                br#"{"messages":[]}"#,
            )
            .await
            .unwrap();

        let authorization = headers.get(AUTHORIZATION).unwrap().to_str().unwrap();
        assert!(authorization.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
        assert!(authorization.contains("/us-west-2/bedrock/aws4_request"));
        assert!(authorization.contains("SignedHeaders="));
        assert!(authorization.contains("host"));
        assert!(headers.contains_key("x-amz-date"));
        assert!(!headers.contains_key("x-amz-security-token"));
    }

    #[tokio::test]
    async fn test_sign_includes_session_token() {
        let signer = SigV4Signer::new(StaticCredentialSource::new(
            "AKIDEXAMPLE",
            "secret",
            Some("session-token".to_string()),
        ));
        let mut headers = request_headers();

        signer
            .sign(
                &region("us-west-2"),
                &Method::POST,
                "https://bedrock-runtime.us-west-2.amazonaws.com/model/anthropic.claude-3/invoke",
                &mut headers,
                b"{}",
            )
            .await
            .unwrap();

        assert_eq!(
            headers.get("x-amz-security-token").unwrap(),
            "session-token"
        );
    }

    #[test]
    fn test_credentials_near_expiry_need_refresh() {
        let now = SystemTime::now();
        let expiring = Credentials::new("a", "b", None, Some(now + Duration::from_secs(60)), "t");
        let fresh = Credentials::new("a", "b", None, Some(now + Duration::from_secs(3600)), "t");
        let permanent = Credentials::new("a", "b", None, None, "t");

        assert!(needs_refresh(&expiring, now));
        assert!(!needs_refresh(&fresh, now));
        assert!(!needs_refresh(&permanent, now));
    }
}
