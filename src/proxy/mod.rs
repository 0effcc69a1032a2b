//! Proxy module for handling LLM API requests
//!
//! Requests arrive as `/<provider>/<upstream-host>/<path>`, are forwarded
//! with their bytes untouched, and are recorded on the way through:
//! - Route decoding and header filtering
//! - The streaming tee that copies responses to the client and the logger
//! - The axum service with health endpoints

pub mod error_response;
pub mod headers;
pub mod hot_path;
pub mod middleware;
pub mod route;
pub mod service;
pub mod sse;
pub mod streaming;
pub mod types;

pub use hot_path::ProxyEngine;
pub use route::{ProxyRoute, RouteError};
pub use service::ProxyService;
pub use types::{ProxyConfig, ProxyError, ProxyResult, RequestId, UpstreamHost};
