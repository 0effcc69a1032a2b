//! Request forwarding
//!
//! One inbound request: decode the route, tag it with a session, log the
//! request, dispatch upstream (signed when Bedrock), then forward the response
//! through the tee and log it. Client-visible failures are limited to routing,
//! body size, signing and the upstream itself; logging never fails a request.

use crate::application::session_manager::{SessionManager, SessionRef};
use crate::domain::log_entry::{
    logged_headers, EntryContext, LoggedBody, LoggedHeaders, LogEntryKind, RequestRecord,
    ResponseRecord,
};
use crate::infrastructure::log_messages::request_processing as msg;
use crate::infrastructure::multi_sink::MultiSinkWriter;
use crate::providers::bedrock::auth::strip_client_signing_headers;
use crate::providers::bedrock::eventstream::EventStreamAccumulator;
use crate::providers::bedrock::BedrockProvider;
use crate::providers::{Provider, Transport};
use crate::proxy::error_response::ErrorResponseExt;
use crate::proxy::headers::{
    client_response_headers, strip_hop_by_hop, upstream_request_headers,
};
use crate::proxy::route::ProxyRoute;
use crate::proxy::sse::SseAccumulator;
use crate::proxy::streaming::{read_to_end, spawn_tee, CaptureAccumulator, ResponseKind, TeeOutcome};
use crate::proxy::types::{error_chain, ProxyConfig, ProxyError, ProxyResult, RequestId};
use axum::body::Body;
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use http::request::Parts;
use http::{HeaderMap, Method, Request, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};

/// Session id and host directory for requests that never reach a session
pub const REJECTED_SESSION_ID: &str = "rejected";
pub const REJECTED_HOST_DIR: &str = "_rejected";

/// The request handler shared by every connection
pub struct ProxyEngine {
    config: ProxyConfig,
    client: reqwest::Client,
    sessions: Arc<SessionManager>,
    sink: Arc<MultiSinkWriter>,
    bedrock: Arc<BedrockProvider>,
}

impl ProxyEngine {
    pub fn new(
        config: ProxyConfig,
        client: reqwest::Client,
        sessions: Arc<SessionManager>,
        sink: Arc<MultiSinkWriter>,
        bedrock: Arc<BedrockProvider>,
    ) -> Self {
        Self {
            config,
            client,
            sessions,
            sink,
            bedrock,
        }
    }

    pub fn sink(&self) -> &Arc<MultiSinkWriter> {
        &self.sink
    }

    pub fn bedrock(&self) -> &Arc<BedrockProvider> {
        &self.bedrock
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Serve one proxied request. Errors become JSON error responses.
    #[instrument(skip_all, fields(request_id = %request_id, method = %request.method()))]
    pub async fn handle(&self, request: Request<Body>, request_id: RequestId) -> Response {
        let started = Instant::now();
        let (parts, body) = request.into_parts();

        let body = match read_request_body(body, self.config.max_request_body).await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, limit = self.config.max_request_body, "{}", msg::BODY_TOO_LARGE);
                return e.into_response_for(request_id);
            }
        };

        let route = match ProxyRoute::parse(&parts.uri, &parts.headers) {
            Ok(route) => route,
            Err(e) => {
                warn!(error = %e, path = parts.uri.path(), "{}", msg::REJECTED);
                self.log_rejected(&parts, &body, &e.to_string(), request_id);
                return ProxyError::from(e).into_response_for(request_id);
            }
        };

        let host = route.upstream_host.as_ref();
        let base = EntryContext {
            machine_id: self.config.machine_id.clone(),
            session_id: String::new(),
            upstream_host: host.to_string(),
            provider: Some(route.provider),
            transport: route.provider.transport(),
            request_id: Some(request_id.to_string()),
        };
        let mut session = self.sessions.tag(route.provider, host, &body, &base).await;
        debug!(session_id = session.session_id(), seq = session.seq, provider = %route.provider, "Tagged request");

        let (target, headers, prepare_error) =
            match self.prepare_upstream(&route, &parts.method, &parts.headers, &body).await {
                Ok((target, headers)) => (target, headers, None),
                Err((target, e)) => (target, strip_hop_by_hop(&parts.headers), Some(e)),
            };

        self.sink.emit(session.entry(LogEntryKind::Request(RequestRecord {
            method: parts.method.to_string(),
            url: target.clone(),
            headers: logged_headers(&headers),
            body: LoggedBody::from_bytes(&body),
            rejected: false,
            error: None,
        })));

        if let Some(e) = prepare_error {
            warn!(error = %e, "{}", msg::SIGNING_FAILED);
            return self.fail(session, e, started, request_id).await;
        }

        let send = self
            .client
            .request(parts.method.clone(), target.as_str())
            .headers(headers)
            .body(body)
            .send();
        let sent = match self.config.idle_read_timeout {
            Some(limit) => match tokio::time::timeout(limit, send).await {
                Ok(sent) => sent.map_err(|e| ProxyError::from_upstream(&e)),
                Err(_) => Err(ProxyError::UpstreamTimeout(format!(
                    "no response headers within {}",
                    humantime::format_duration(limit)
                ))),
            },
            None => send.await.map_err(|e| ProxyError::from_upstream(&e)),
        };
        let upstream = match sent {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(error = %e, url = %target, "{}", msg::UPSTREAM_FAILED);
                return self.fail(session, e, started, request_id).await;
            }
        };

        let status = upstream.status();
        let upstream_headers = upstream.headers().clone();
        let kind = ResponseKind::classify(&upstream_headers);
        debug!(status = status.as_u16(), ?kind, "Upstream responded");

        if kind.is_streamed() {
            // The response entry is only written when the stream ends
            session.release_lock();
            self.stream_response(
                session,
                upstream,
                status,
                upstream_headers,
                kind,
                route.provider,
                started,
            )
        } else {
            self.buffered_response(session, upstream, status, upstream_headers, started, request_id)
                .await
        }
    }

    /// Target URL and outbound headers, signed for Bedrock. On failure the
    /// target URL is still returned so the request entry can name it.
    async fn prepare_upstream(
        &self,
        route: &ProxyRoute,
        method: &Method,
        client_headers: &HeaderMap,
        body: &[u8],
    ) -> Result<(String, HeaderMap), (String, ProxyError)> {
        let host = route.upstream_host.as_ref();
        let target = if route.provider == Provider::Bedrock {
            self.bedrock.target_url(host, &route.upstream_path).map_err(|e| {
                let fallback = format!("https://{host}{}", route.upstream_path);
                (fallback, ProxyError::from(e))
            })?
        } else {
            resolve_target(&self.config.upstream_overrides, host, &route.upstream_path)
        };

        let authority = match reqwest::Url::parse(&target) {
            Ok(url) => authority_of(&url),
            Err(e) => return Err((target, ProxyError::Internal(format!("invalid upstream URL: {e}")))),
        };
        let mut headers = upstream_request_headers(client_headers, &authority);

        if route.provider == Provider::Bedrock {
            strip_client_signing_headers(&mut headers);
            let signed = match self.bedrock.region_for(host) {
                Ok(region) => {
                    self.bedrock
                        .sign(&region, method, &target, &mut headers, body)
                        .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = signed {
                return Err((target, ProxyError::from(e)));
            }
        }

        Ok((target, headers))
    }

    /// Log a proxy-side failure as the response, complete the session and
    /// answer the client
    async fn fail(&self, session: SessionRef, error: ProxyError, started: Instant, request_id: RequestId) -> Response {
        let status = error.status_code();
        self.sink.emit(session.entry(LogEntryKind::Response(ResponseRecord {
            status: status.as_u16(),
            duration_ms: elapsed_ms(started),
            headers: LoggedHeaders::new(),
            body: None,
            events: None,
            truncated: false,
            error: Some(error.to_string()),
        })));
        self.sessions.complete(session).await;
        error.into_response_for(request_id)
    }

    async fn buffered_response(
        &self,
        session: SessionRef,
        upstream: reqwest::Response,
        status: StatusCode,
        upstream_headers: HeaderMap,
        started: Instant,
        request_id: RequestId,
    ) -> Response {
        let body = match read_to_end(upstream.bytes_stream(), self.config.idle_read_timeout).await {
            Ok(body) => body,
            Err((partial, reason)) => {
                warn!(error = %reason, received = partial.len(), "{}", msg::UPSTREAM_FAILED);
                self.sink.emit(session.entry(LogEntryKind::Response(ResponseRecord {
                    status: StatusCode::BAD_GATEWAY.as_u16(),
                    duration_ms: elapsed_ms(started),
                    headers: logged_headers(&upstream_headers),
                    body: LoggedBody::from_bytes(&partial),
                    events: None,
                    truncated: true,
                    error: Some(reason.clone()),
                })));
                self.sessions.complete(session).await;
                return ProxyError::UpstreamIo(reason).into_response_for(request_id);
            }
        };

        self.sink.emit(session.entry(LogEntryKind::Response(ResponseRecord {
            status: status.as_u16(),
            duration_ms: elapsed_ms(started),
            headers: logged_headers(&upstream_headers),
            body: LoggedBody::from_bytes(&body),
            events: None,
            truncated: false,
            error: None,
        })));
        self.sessions.complete(session).await;

        client_response(
            status,
            client_response_headers(&upstream_headers, false),
            Body::from(body),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn stream_response(
        &self,
        session: SessionRef,
        upstream: reqwest::Response,
        status: StatusCode,
        upstream_headers: HeaderMap,
        kind: ResponseKind,
        provider: Provider,
        started: Instant,
    ) -> Response {
        let accumulator: Box<dyn CaptureAccumulator> = match kind {
            ResponseKind::EventStream => Box::new(EventStreamAccumulator::new(self.bedrock.health())),
            _ => Box::new(SseAccumulator::new()),
        };

        let sink = Arc::clone(&self.sink);
        let sessions = Arc::clone(&self.sessions);
        let logged = logged_headers(&upstream_headers);
        let on_complete = move |outcome: TeeOutcome| async move {
            if outcome.truncated {
                debug!(
                    session_id = session.session_id(),
                    %provider,
                    bytes = outcome.bytes,
                    error = outcome.error.as_deref(),
                    "{}",
                    msg::STREAM_TRUNCATED
                );
            }
            sink.emit(session.entry(LogEntryKind::Response(ResponseRecord {
                status: status.as_u16(),
                duration_ms: elapsed_ms(started),
                headers: logged,
                body: None,
                events: Some(outcome.events),
                truncated: outcome.truncated,
                error: outcome.error,
            })));
            sessions.complete(session).await;
        };

        let body = spawn_tee(
            upstream.bytes_stream(),
            accumulator,
            self.config.idle_read_timeout,
            on_complete,
        );
        client_response(
            status,
            client_response_headers(&upstream_headers, true),
            Body::new(body),
        )
    }

    fn log_rejected(&self, parts: &Parts, body: &[u8], reason: &str, request_id: RequestId) {
        let uri = &parts.uri;
        let provider = ProxyRoute::provider_hint(uri);
        let context = EntryContext {
            machine_id: self.config.machine_id.clone(),
            session_id: REJECTED_SESSION_ID.to_string(),
            upstream_host: REJECTED_HOST_DIR.to_string(),
            provider,
            transport: provider.map(|p| p.transport()).unwrap_or(Transport::Http),
            request_id: Some(request_id.to_string()),
        };
        let url = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| uri.path().to_string());
        self.sink.emit(context.entry(
            0,
            LogEntryKind::Request(RequestRecord {
                method: parts.method.to_string(),
                url,
                headers: logged_headers(&parts.headers),
                body: LoggedBody::from_bytes(body),
                rejected: true,
                error: Some(reason.to_string()),
            }),
        ));
    }
}

fn client_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Read the inbound body, failing once it grows past `limit` bytes
pub async fn read_request_body(body: Body, limit: usize) -> ProxyResult<Bytes> {
    let mut stream = body.into_data_stream();
    let mut collected = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ProxyError::BodyRead(error_chain(&e)))?;
        if collected.len() + chunk.len() > limit {
            return Err(ProxyError::RequestTooLarge { limit });
        }
        collected.extend_from_slice(&chunk);
    }
    Ok(collected.freeze())
}

/// `https://<host><path>`, unless the host is redirected to another base URL
pub fn resolve_target(overrides: &HashMap<String, String>, host: &str, path: &str) -> String {
    match overrides.get(host) {
        Some(base) => format!("{}{path}", base.trim_end_matches('/')),
        None => format!("https://{host}{path}"),
    }
}

fn authority_of(url: &reqwest::Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
