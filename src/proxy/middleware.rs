//! Middleware for the proxy router

use crate::proxy::headers::X_REQUEST_ID;
use crate::proxy::types::RequestId;
use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use std::time::Instant;
use tracing::info;

/// Give every request a [`RequestId`] and echo it on the response.
///
/// A valid UUID supplied by the client is kept. The inbound headers are left
/// untouched so the upstream sees exactly what the client sent; an
/// `x-request-id` set by the upstream wins on the way back.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = RequestId::from_header(request.headers().get(X_REQUEST_ID));
    request.extensions_mut().insert(request_id);

    let mut response = next.run(request).await;

    if !response.headers().contains_key(X_REQUEST_ID) {
        if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
            response.headers_mut().insert(X_REQUEST_ID, value);
        }
    }
    response
}

/// One line per request with status and time to response headers
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(ToString::to_string)
        .unwrap_or_default();

    let response = next.run(request).await;

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Request completed"
    );
    response
}
