//! Unified error response handling for the proxy service
//!
//! Errors the proxy itself produces (as opposed to upstream errors, which are
//! passed through untouched) share one JSON shape carrying the request id.

use crate::proxy::headers::X_REQUEST_ID;
use crate::proxy::types::{ProxyError, RequestId};
use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// Standard error response format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Unique error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Request ID for correlation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Convert to HTTP response with proper headers
    pub fn into_response_with_status(self, status: StatusCode) -> Response {
        let request_id = self.request_id.clone();
        let mut response = (status, Json(self)).into_response();

        if let Some(id) = request_id {
            if let Ok(header_value) = HeaderValue::from_str(&id) {
                response.headers_mut().insert(X_REQUEST_ID, header_value);
            }
        }

        response
    }
}

/// Extension trait for consistent error formatting
pub trait ErrorResponseExt {
    /// Convert to standardized error response
    fn to_error_response(&self) -> ErrorResponse;

    /// Get the appropriate HTTP status code
    fn status_code(&self) -> StatusCode;

    /// Response for a specific request
    fn into_response_for(self, request_id: RequestId) -> Response
    where
        Self: Sized,
    {
        let status = self.status_code();
        self.to_error_response()
            .with_request_id(request_id.to_string())
            .into_response_with_status(status)
    }
}

impl ErrorResponseExt for ProxyError {
    fn to_error_response(&self) -> ErrorResponse {
        use ProxyError::*;

        let code = match self {
            MalformedRoute(_) => "MALFORMED_ROUTE",
            RequestTooLarge { .. } => "REQUEST_TOO_LARGE",
            BodyRead(_) => "BAD_REQUEST",
            UpstreamDial(_) => "UPSTREAM_UNREACHABLE",
            UpstreamIo(_) => "UPSTREAM_ERROR",
            UpstreamTimeout(_) => "UPSTREAM_TIMEOUT",
            Signing(_) => "SIGNING_ERROR",
            Internal(_) => "INTERNAL_ERROR",
        };
        ErrorResponse::new(code, self.to_string())
    }

    fn status_code(&self) -> StatusCode {
        use ProxyError::*;

        match self {
            MalformedRoute(_) | BodyRead(_) => StatusCode::BAD_REQUEST,
            RequestTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            UpstreamDial(_) | UpstreamIo(_) => StatusCode::BAD_GATEWAY,
            UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Signing(_) | Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error conversion for Axum responses using standardized format
impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        self.to_error_response().into_response_with_status(status)
    }
}
