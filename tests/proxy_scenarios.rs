//! End-to-end scenarios: a real proxy in front of an axum mock upstream

mod common;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use common::{read_entries, spawn_upstream, today, wait_for_entries, TestProxy};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

const ANTHROPIC_HOST: &str = "api.anthropic.com";
const OPENAI_HOST: &str = "api.openai.com";
const MESSAGES_PATH: &str = "/anthropic/api.anthropic.com/v1/messages";
const UPSTREAM_REPLY: &str = r#"{"content":[{"type":"text","text":"hello"}]}"#;
const EVENT_0: &[u8] = b"event: message\ndata: {\"i\":0}\n\n";
const EVENT_1: &[u8] = b"data: {\"i\":1}\n\n";

#[derive(Clone, Default)]
struct Recorded(Arc<Mutex<Vec<(HeaderMap, Bytes)>>>);

impl Recorded {
    fn last(&self) -> (HeaderMap, Bytes) {
        self.0.lock().last().cloned().unwrap()
    }
}

async fn messages(State(recorded): State<Recorded>, headers: HeaderMap, body: Bytes) -> impl IntoResponse {
    recorded.0.lock().push((headers, body));
    ([(CONTENT_TYPE, "application/json")], UPSTREAM_REPLY)
}

async fn rate_limited() -> impl IntoResponse {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(CONTENT_TYPE, "application/json"), ("retry-after", "7")],
        r#"{"error":{"type":"rate_limit_error"}}"#,
    )
}

/// Two SSE events, `gap` apart, then `tail` more of silence before the end
fn sse_response(gap: Duration, tail: Duration) -> Response {
    let chunks = futures_util::stream::unfold(0u8, move |step| async move {
        match step {
            0 => Some((Ok::<_, Infallible>(Bytes::from_static(EVENT_0)), 1)),
            1 => {
                tokio::time::sleep(gap).await;
                Some((Ok(Bytes::from_static(EVENT_1)), 2))
            }
            2 => {
                tokio::time::sleep(tail).await;
                None
            }
            _ => None,
        }
    });
    Response::builder()
        .header(CONTENT_TYPE, "text/event-stream")
        .header("cache-control", "no-cache")
        .body(Body::from_stream(chunks))
        .unwrap()
}

fn upstream_router(recorded: Recorded) -> Router {
    Router::new()
        .route("/v1/messages", post(messages))
        .route("/v1/limited", post(rate_limited))
        .route(
            "/v1/stream",
            post(|| async { sse_response(Duration::from_millis(100), Duration::ZERO) }),
        )
        .route(
            "/v1/slow-stream",
            post(|| async { sse_response(Duration::from_secs(3), Duration::ZERO) }),
        )
        .with_state(recorded)
}

fn anthropic_body(user: &str, messages: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "model": "claude-x",
        "messages": messages,
        "metadata": {"user_id": user}
    }))
    .unwrap()
}

async fn post_json(client: &reqwest::Client, url: &str, body: Vec<u8>) -> reqwest::Response {
    client
        .post(url)
        .header("content-type", "application/json")
        .header("x-api-key", "sk-ant-REDACTED")
        .header("anthropic-version", "2023-06-01")
        .body(body)
        .send()
        .await
        .unwrap()
}

fn types(entries: &[Value]) -> Vec<&str> {
    entries.iter().map(|e| e["type"].as_str().unwrap()).collect()
}

#[tokio::test]
async fn test_anthropic_request_is_forwarded_and_logged() {
    let recorded = Recorded::default();
    let upstream = spawn_upstream(upstream_router(recorded.clone())).await;
    let proxy = TestProxy::start(ANTHROPIC_HOST, upstream, |_| {}).await;
    let client = reqwest::Client::new();

    let body = br#"{"model":"claude-x","messages":[{"role":"user","content":"hi"}],"metadata":{"user_id":"u1"}}"#;
    let response = post_json(&client, &proxy.url(MESSAGES_PATH), body.to_vec()).await;

    assert_eq!(response.status(), 200);
    let request_id = response.headers()["x-request-id"].to_str().unwrap().to_string();
    assert_eq!(response.bytes().await.unwrap(), UPSTREAM_REPLY.as_bytes());

    let (upstream_headers, upstream_body) = recorded.last();
    assert_eq!(&upstream_body[..], &body[..]);
    assert_eq!(upstream_headers["host"], upstream.to_string().as_str());
    assert_eq!(upstream_headers["x-api-key"], "sk-ant-REDACTED");
    assert_eq!(upstream_headers["anthropic-version"], "2023-06-01");

    let files = proxy.session_files(ANTHROPIC_HOST);
    assert_eq!(files.len(), 1);
    assert!(files[0].parent().unwrap().ends_with(format!("{ANTHROPIC_HOST}/{}", today())));

    let raw = std::fs::read_to_string(&files[0]).unwrap();
    assert!(!raw.contains("secretsecretsecret"));

    let entries = read_entries(&files[0]);
    assert_eq!(types(&entries), vec!["session_start", "request", "response"]);
    assert_eq!(entries[0]["client_session_id"], "u1");
    assert_eq!(entries[0]["seq"], 0);
    assert_eq!(entries[1]["seq"], 1);
    assert_eq!(entries[1]["method"], "POST");
    assert_eq!(entries[1]["provider"], "anthropic");
    assert_eq!(entries[1]["transport"], "http");
    assert_eq!(entries[1]["request_id"], request_id.as_str());
    assert_eq!(entries[1]["body"]["metadata"]["user_id"], "u1");
    assert!(entries[1]["headers"]["x-api-key"]
        .as_str()
        .unwrap()
        .contains("redacted(len=31)"));
    assert_eq!(entries[2]["status"], 200);
    assert_eq!(entries[2]["seq"], 1);
    assert_eq!(entries[2]["truncated"], false);
    assert_eq!(entries[2]["body"], serde_json::from_str::<Value>(UPSTREAM_REPLY).unwrap());
    assert!(raw.contains(&format!(r#""body":{UPSTREAM_REPLY}"#)));

    let session_id = entries[0]["session_id"].as_str().unwrap();
    assert!(entries.iter().all(|e| e["session_id"] == session_id));
    assert!(entries.iter().all(|e| e["machine_id"] == "test-host"));

    proxy.stop().await;
}

#[tokio::test]
async fn test_conversation_extension_and_fork() {
    let upstream = spawn_upstream(upstream_router(Recorded::default())).await;
    let proxy = TestProxy::start(ANTHROPIC_HOST, upstream, |_| {}).await;
    let client = reqwest::Client::new();
    let url = proxy.url(MESSAGES_PATH);

    let first = anthropic_body("u1", json!([{"role": "user", "content": "hi"}]));
    assert_eq!(post_json(&client, &url, first).await.status(), 200);
    let files = proxy.session_files(ANTHROPIC_HOST);
    assert_eq!(files.len(), 1);
    let original_id = read_entries(&files[0])[0]["session_id"]
        .as_str()
        .unwrap()
        .to_string();

    // Extension: same session, next seq
    let second = anthropic_body(
        "u1",
        json!([
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": [{"type": "text", "text": "hello"}]},
            {"role": "user", "content": "more"}
        ]),
    );
    assert_eq!(post_json(&client, &url, second).await.status(), 200);
    assert_eq!(proxy.session_files(ANTHROPIC_HOST).len(), 1);
    let entries = read_entries(&proxy.session_file(ANTHROPIC_HOST, &original_id));
    assert_eq!(
        types(&entries),
        vec!["session_start", "request", "response", "request", "response"]
    );
    assert_eq!(entries[3]["seq"], 2);
    assert_eq!(entries[4]["seq"], 2);

    // Divergence at index 1: a child session forked from the original
    let third = anthropic_body(
        "u1",
        json!([
            {"role": "user", "content": "hi"},
            {"role": "user", "content": "restart"}
        ]),
    );
    assert_eq!(post_json(&client, &url, third).await.status(), 200);
    let files = proxy.session_files(ANTHROPIC_HOST);
    assert_eq!(files.len(), 2);

    let parent_entries = read_entries(&proxy.session_file(ANTHROPIC_HOST, &original_id));
    let fork = parent_entries.last().unwrap();
    assert_eq!(fork["type"], "fork");
    assert_eq!(fork["parent_id"], original_id.as_str());
    let child_id = fork["child_id"].as_str().unwrap().to_string();
    assert_ne!(child_id, original_id);

    let child_entries = read_entries(&proxy.session_file(ANTHROPIC_HOST, &child_id));
    assert_eq!(types(&child_entries), vec!["fork", "request", "response"]);
    assert_eq!(child_entries[0]["parent_id"], original_id.as_str());
    assert_eq!(child_entries[1]["seq"], 1);

    // A different client never touches u1's sessions
    let other = anthropic_body("u2", json!([{"role": "user", "content": "hi"}]));
    assert_eq!(post_json(&client, &url, other).await.status(), 200);
    assert_eq!(proxy.session_files(ANTHROPIC_HOST).len(), 3);

    proxy.stop().await;
}

#[tokio::test]
async fn test_sse_stream_is_forwarded_and_logged() {
    let upstream = spawn_upstream(upstream_router(Recorded::default())).await;
    let proxy = TestProxy::start(ANTHROPIC_HOST, upstream, |_| {}).await;
    let client = reqwest::Client::new();

    let response = client
        .post(proxy.url("/anthropic/api.anthropic.com/v1/stream"))
        .header("accept", "text/event-stream")
        .body(anthropic_body("u-sse", json!([{"role": "user", "content": "hi"}])))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    assert!(response.headers().get("content-length").is_none());

    let mut stream = response.bytes_stream();
    let mut received = Vec::new();
    let first = stream.next().await.unwrap().unwrap();
    assert!(first.starts_with(b"event: message"));
    received.extend_from_slice(&first);
    while let Some(chunk) = stream.next().await {
        received.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(received, [EVENT_0, EVENT_1].concat());

    let file = proxy.session_files(ANTHROPIC_HOST).remove(0);
    let entries = wait_for_entries(&file, 3).await;
    let response_entry = &entries[2];
    assert_eq!(response_entry["type"], "response");
    assert_eq!(response_entry["truncated"], false);
    assert!(response_entry.get("body").is_none());
    assert_eq!(
        response_entry["events"],
        json!([
            {"event": "message", "data": {"i": 0}},
            {"data": {"i": 1}}
        ])
    );

    proxy.stop().await;
}

#[tokio::test]
async fn test_client_disconnect_truncates_stream() {
    let upstream = spawn_upstream(upstream_router(Recorded::default())).await;
    let proxy = TestProxy::start(ANTHROPIC_HOST, upstream, |_| {}).await;

    {
        let client = reqwest::Client::new();
        let response = client
            .post(proxy.url("/anthropic/api.anthropic.com/v1/slow-stream"))
            .body(anthropic_body("u-gone", json!([{"role": "user", "content": "hi"}])))
            .send()
            .await
            .unwrap();
        let mut stream = response.bytes_stream();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(&first[..], EVENT_0);
    }

    let file = proxy.session_files(ANTHROPIC_HOST).remove(0);
    let entries = wait_for_entries(&file, 3).await;
    assert_eq!(entries[2]["type"], "response");
    assert_eq!(entries[2]["truncated"], true);
    assert_eq!(entries[2]["events"], json!([{"event": "message", "data": {"i": 0}}]));

    proxy.stop().await;
}

#[tokio::test]
async fn test_upstream_status_is_passed_through() {
    let upstream = spawn_upstream(upstream_router(Recorded::default())).await;
    let proxy = TestProxy::start(ANTHROPIC_HOST, upstream, |_| {}).await;
    let client = reqwest::Client::new();

    let response = post_json(
        &client,
        &proxy.url("/anthropic/api.anthropic.com/v1/limited"),
        anthropic_body("u1", json!([])),
    )
    .await;
    assert_eq!(response.status(), 429);
    assert_eq!(response.headers()["retry-after"], "7");
    assert_eq!(
        response.bytes().await.unwrap(),
        r#"{"error":{"type":"rate_limit_error"}}"#.as_bytes()
    );

    let entries = read_entries(&proxy.session_files(ANTHROPIC_HOST)[0]);
    assert_eq!(entries[2]["status"], 429);
    assert!(entries[2].get("error").is_none());

    proxy.stop().await;
}

#[tokio::test]
async fn test_unreachable_upstream_returns_502_and_is_logged() {
    let closed: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
    let proxy = TestProxy::start(OPENAI_HOST, closed, |_| {}).await;
    let client = reqwest::Client::new();

    let body = serde_json::to_vec(&json!({
        "model": "gpt-x",
        "user": "u-openai",
        "messages": [{"role": "user", "content": "hi"}]
    }))
    .unwrap();
    let response = client
        .post(proxy.url("/openai/api.openai.com/v1/chat/completions"))
        .header("authorization", "Bearer sk-proj-abcdef")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
    let error: Value = serde_json::from_slice(&response.bytes().await.unwrap()).unwrap();
    assert_eq!(error["code"], "UPSTREAM_UNREACHABLE");

    let entries = read_entries(&proxy.session_files(OPENAI_HOST)[0]);
    assert_eq!(types(&entries), vec!["session_start", "request", "response"]);
    assert_eq!(entries[0]["client_session_id"], "u-openai");
    assert_eq!(entries[2]["status"], 502);
    assert!(entries[2]["error"].as_str().is_some());

    proxy.stop().await;
}

#[tokio::test]
async fn test_oversized_request_is_refused() {
    let upstream = spawn_upstream(upstream_router(Recorded::default())).await;
    let proxy = TestProxy::start(ANTHROPIC_HOST, upstream, |settings| {
        settings.max_request_body = 64;
    })
    .await;

    let response = post_json(&reqwest::Client::new(), &proxy.url(MESSAGES_PATH), vec![b'x'; 65]).await;
    assert_eq!(response.status(), 413);
    assert!(proxy.session_files(ANTHROPIC_HOST).is_empty());

    proxy.stop().await;
}

#[tokio::test]
async fn test_exporter_outage_does_not_affect_requests() {
    let upstream = spawn_upstream(upstream_router(Recorded::default())).await;
    let proxy = TestProxy::start(ANTHROPIC_HOST, upstream, |settings| {
        settings.loki.enabled = true;
        settings.loki.url = Some("http://127.0.0.1:1/loki/api/v1/push".to_string());
        settings.loki.batch_size = 10;
        settings.loki.batch_wait = Duration::from_millis(50);
        settings.loki.retry_max = 0;
    })
    .await;
    let client = reqwest::Client::new();

    for i in 0..100 {
        let body = anthropic_body(&format!("user-{i}"), json!([{"role": "user", "content": "hi"}]));
        let response = post_json(&client, &proxy.url(MESSAGES_PATH), body).await;
        assert_eq!(response.status(), 200);
    }

    let files = proxy.session_files(ANTHROPIC_HOST);
    assert_eq!(files.len(), 100);
    for file in &files {
        assert_eq!(
            types(&read_entries(file)),
            vec!["session_start", "request", "response"]
        );
    }

    let mut stats = Value::Null;
    for _ in 0..100 {
        let body = client
            .get(proxy.url("/health/loki"))
            .send()
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        stats = serde_json::from_slice(&body).unwrap();
        if stats["dropped_batches"].as_u64().unwrap_or(0) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(stats["enabled"], true);
    assert_eq!(stats["enqueued"], 300);
    assert!(stats["dropped_batches"].as_u64().unwrap() > 0);
    assert_eq!(stats["pushed_batches"], 0);

    proxy.stop().await;
}
