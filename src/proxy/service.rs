//! Main proxy service implementation
//!
//! The `ProxyService` wraps the [`ProxyEngine`] in an axum router: health
//! endpoints under `/health`, every other path proxied. A session database
//! outage shows on `/health` but leaves the proxy serving.
//!
//! ```rust,ignore
//! let service = ProxyService::new(engine);
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8787").await?;
//! axum::serve(listener, service.into_router()).await?;
//! ```

use crate::infrastructure::loki_exporter::ExporterStatsSnapshot;
use crate::providers::bedrock::health::BedrockHealthReport;
use crate::proxy::headers::paths;
use crate::proxy::hot_path::ProxyEngine;
use crate::proxy::middleware::{logging_middleware, request_id_middleware};
use crate::proxy::types::RequestId;
use axum::{
    body::Body,
    extract::{Request, State},
    middleware::from_fn,
    response::Response,
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Proxy HTTP service
#[derive(Clone)]
pub struct ProxyService {
    engine: Arc<ProxyEngine>,
}

impl ProxyService {
    pub fn new(engine: ProxyEngine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }

    pub fn engine(&self) -> &Arc<ProxyEngine> {
        &self.engine
    }

    /// Create an Axum router for the proxy service with middleware
    pub fn into_router(self) -> Router {
        Router::new()
            .route(paths::HEALTH, get(health_handler))
            .route(paths::HEALTH_BEDROCK, get(bedrock_health_handler))
            .route(paths::HEALTH_LOKI, get(loki_health_handler))
            .fallback(proxy_handler)
            .with_state(self.engine)
            .layer(from_fn(logging_middleware))
            .layer(from_fn(request_id_middleware))
            .layer(TraceLayer::new_for_http())
    }
}

/// Axum handler for proxying requests
async fn proxy_handler(State(engine): State<Arc<ProxyEngine>>, request: Request<Body>) -> Response {
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .copied()
        .unwrap_or_else(RequestId::generate);
    engine.handle(request, request_id).await
}

async fn health_handler(State(engine): State<Arc<ProxyEngine>>) -> Json<Value> {
    let sessions_db = match engine.sessions().store().health_check().await {
        Ok(()) => "ok",
        Err(e) => {
            warn!(error = %e, "Session database health check failed");
            "unavailable"
        }
    };
    Json(json!({ "status": "ok", "sessions_db": sessions_db }))
}

async fn bedrock_health_handler(State(engine): State<Arc<ProxyEngine>>) -> Json<BedrockHealthReport> {
    Json(engine.bedrock().health().report())
}

async fn loki_health_handler(State(engine): State<Arc<ProxyEngine>>) -> Json<ExporterStatsSnapshot> {
    Json(engine.sink().exporter_stats())
}
