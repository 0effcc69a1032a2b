//! Response tee: forward upstream bytes to the client untouched while a
//! capture accumulator builds the logged form of the response.
//!
//! A pump task reads the upstream, feeds each chunk to the accumulator and
//! then hands the same `Bytes` to the client through a bounded channel. When
//! the client goes away the pump reads on only until the accumulator is at an
//! event or frame boundary, then drops the upstream, which cancels it.

use crate::domain::log_entry::StreamEvent;
use crate::proxy::headers::content_types::{AMAZON_EVENTSTREAM, TEXT_EVENT_STREAM};
use crate::proxy::headers::CONTENT_TYPE;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use http::HeaderMap;
use http_body::{Body, Frame};
use std::fmt::Display;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Chunks buffered between the pump and the client connection
const TEE_CHANNEL_CAPACITY: usize = 32;

/// Longest the pump keeps reading after a disconnect to reach a boundary
pub const DRAIN_LIMIT: Duration = Duration::from_secs(5);

/// Builds the logged form of a streamed response
pub trait CaptureAccumulator: Send {
    fn feed(&mut self, chunk: &[u8]);

    /// No partially received event or frame is buffered
    fn at_boundary(&self) -> bool;

    fn finish(self: Box<Self>) -> Vec<StreamEvent>;
}

/// How a response body is forwarded and logged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Buffered,
    Sse,
    EventStream,
}

impl ResponseKind {
    pub fn classify(headers: &HeaderMap) -> Self {
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_ascii_lowercase())
            .unwrap_or_default();
        if content_type.starts_with(TEXT_EVENT_STREAM) {
            Self::Sse
        } else if content_type.starts_with(AMAZON_EVENTSTREAM) {
            Self::EventStream
        } else {
            Self::Buffered
        }
    }

    pub fn is_streamed(&self) -> bool {
        !matches!(self, Self::Buffered)
    }
}

/// What the pump saw by the time the stream ended
#[derive(Debug, Default)]
pub struct TeeOutcome {
    pub events: Vec<StreamEvent>,
    pub truncated: bool,
    pub error: Option<String>,
    pub bytes: u64,
}

/// Client-facing body fed by the pump task
pub struct ChannelBody {
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.rx
            .poll_recv(cx)
            .map(|item| item.map(|result| result.map(Frame::data)))
    }
}

enum ChunkError {
    Upstream(String),
    Idle(Duration),
}

async fn next_chunk<S, E>(
    upstream: &mut Pin<Box<S>>,
    idle_timeout: Option<Duration>,
) -> Result<Option<Bytes>, ChunkError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let next = match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, upstream.next())
            .await
            .map_err(|_| ChunkError::Idle(limit))?,
        None => upstream.next().await,
    };
    match next {
        Some(Ok(chunk)) => Ok(Some(chunk)),
        Some(Err(e)) => Err(ChunkError::Upstream(e.to_string())),
        None => Ok(None),
    }
}

/// Read a whole upstream body, honouring the idle timeout between chunks
pub async fn read_to_end<S, E>(upstream: S, idle_timeout: Option<Duration>) -> Result<Bytes, (Bytes, String)>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut upstream = Box::pin(upstream);
    let mut body = BytesMut::new();
    loop {
        match next_chunk(&mut upstream, idle_timeout).await {
            Ok(Some(chunk)) => body.extend_from_slice(&chunk),
            Ok(None) => return Ok(body.freeze()),
            Err(ChunkError::Upstream(e)) => return Err((body.freeze(), e)),
            Err(ChunkError::Idle(limit)) => {
                return Err((body.freeze(), idle_message(limit)));
            }
        }
    }
}

fn idle_message(limit: Duration) -> String {
    format!("upstream idle for {}", humantime::format_duration(limit))
}

/// Start the pump and return the body to send to the client.
/// `on_complete` runs once with the outcome after the upstream is done.
pub fn spawn_tee<S, E, F, Fut>(
    upstream: S,
    accumulator: Box<dyn CaptureAccumulator>,
    idle_timeout: Option<Duration>,
    on_complete: F,
) -> ChannelBody
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
    F: FnOnce(TeeOutcome) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(TEE_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let outcome = pump(Box::pin(upstream), accumulator, tx, idle_timeout).await;
        on_complete(outcome).await;
    });
    ChannelBody { rx }
}

async fn pump<S, E>(
    mut upstream: Pin<Box<S>>,
    mut accumulator: Box<dyn CaptureAccumulator>,
    tx: mpsc::Sender<io::Result<Bytes>>,
    idle_timeout: Option<Duration>,
) -> TeeOutcome
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut bytes = 0u64;
    let mut truncated = false;
    let mut error = None;

    loop {
        let next = tokio::select! {
            biased;
            _ = tx.closed() => None,
            next = next_chunk(&mut upstream, idle_timeout) => Some(next),
        };
        let Some(next) = next else {
            truncated = true;
            bytes += drain_to_boundary(&mut upstream, accumulator.as_mut()).await;
            break;
        };

        match next {
            Ok(Some(chunk)) => {
                bytes += chunk.len() as u64;
                accumulator.feed(&chunk);
                if tx.send(Ok(chunk)).await.is_err() {
                    truncated = true;
                    bytes += drain_to_boundary(&mut upstream, accumulator.as_mut()).await;
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let message = match e {
                    ChunkError::Upstream(message) => message,
                    ChunkError::Idle(limit) => idle_message(limit),
                };
                truncated = true;
                let _ = tx.send(Err(io::Error::other(message.clone()))).await;
                error = Some(message);
                break;
            }
        }
    }

    drop(upstream);
    TeeOutcome {
        events: accumulator.finish(),
        truncated,
        error,
        bytes,
    }
}

async fn drain_to_boundary<S, E>(
    upstream: &mut Pin<Box<S>>,
    accumulator: &mut dyn CaptureAccumulator,
) -> u64
where
    S: Stream<Item = Result<Bytes, E>>,
{
    let deadline = Instant::now() + DRAIN_LIMIT;
    let mut drained = 0u64;
    while !accumulator.at_boundary() {
        match tokio::time::timeout_at(deadline, upstream.next()).await {
            Ok(Some(Ok(chunk))) => {
                drained += chunk.len() as u64;
                accumulator.feed(&chunk);
            }
            _ => break,
        }
    }
    drained
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::sse::SseAccumulator;
    use http::HeaderValue;
    use rstest::rstest;
    use serde_json::json;
    use std::convert::Infallible;
    use tokio::sync::oneshot;

    #[rstest]
    #[case("text/event-stream", ResponseKind::Sse)]
    #[case("text/event-stream; charset=utf-8", ResponseKind::Sse)]
    #[case("application/vnd.amazon.eventstream", ResponseKind::EventStream)]
    #[case("application/json", ResponseKind::Buffered)]
    fn test_classify(#[case] content_type: &'static str, #[case] expected: ResponseKind) {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        assert_eq!(ResponseKind::classify(&headers), expected);
    }

    #[test]
    fn test_missing_content_type_is_buffered() {
        assert_eq!(ResponseKind::classify(&HeaderMap::new()), ResponseKind::Buffered);
    }

    async fn collect(mut body: ChannelBody) -> (Vec<u8>, bool) {
        let mut out = Vec::new();
        let mut failed = false;
        while let Some(frame) = std::future::poll_fn(|cx| Pin::new(&mut body).poll_frame(cx)).await {
            match frame {
                Ok(frame) => out.extend_from_slice(frame.data_ref().unwrap()),
                Err(_) => failed = true,
            }
        }
        (out, failed)
    }

    fn tee(
        upstream: impl Stream<Item = Result<Bytes, String>> + Send + 'static,
        idle: Option<Duration>,
    ) -> (ChannelBody, oneshot::Receiver<TeeOutcome>) {
        let (done_tx, done_rx) = oneshot::channel();
        let body = spawn_tee(upstream, Box::new(SseAccumulator::new()), idle, move |outcome| async move {
            let _ = done_tx.send(outcome);
        });
        (body, done_rx)
    }

    #[tokio::test]
    async fn test_bytes_pass_through_unchanged() {
        let chunks: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from_static(b"event: message\ndata: {\"i\"")),
            Ok(Bytes::from_static(b":0}\n\ndata: {\"i\":1}\n\n")),
        ];
        let (body, done) = tee(futures_util::stream::iter(chunks), None);

        let (received, failed) = collect(body).await;
        assert!(!failed);
        assert_eq!(
            received,
            b"event: message\ndata: {\"i\":0}\n\ndata: {\"i\":1}\n\n".to_vec()
        );

        let outcome = done.await.unwrap();
        assert!(!outcome.truncated);
        assert_eq!(outcome.bytes, received.len() as u64);
        assert_eq!(outcome.events.len(), 2);
        assert_eq!(outcome.events[1].data, json!({"i": 1}));
    }

    #[tokio::test]
    async fn test_upstream_error_truncates() {
        let chunks: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from_static(b"data: 1\n\n")),
            Err("connection reset".to_string()),
        ];
        let (body, done) = tee(futures_util::stream::iter(chunks), None);

        let (received, failed) = collect(body).await;
        assert_eq!(received, b"data: 1\n\n".to_vec());
        assert!(failed);

        let outcome = done.await.unwrap();
        assert!(outcome.truncated);
        assert_eq!(outcome.error.as_deref(), Some("connection reset"));
        assert_eq!(outcome.events.len(), 1);
    }

    #[tokio::test]
    async fn test_client_disconnect_drains_to_boundary() {
        let (up_tx, up_rx) = mpsc::channel::<Result<Bytes, String>>(8);
        let upstream = tokio_stream_from(up_rx);
        let (body, done) = tee(upstream, None);

        up_tx.send(Ok(Bytes::from_static(b"data: 1\n\ndata: par"))).await.unwrap();
        // Give the pump time to forward, then hang up
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(body);
        up_tx.send(Ok(Bytes::from_static(b"tial\n\n"))).await.unwrap();
        up_tx.send(Ok(Bytes::from_static(b"data: never\n\n"))).await.ok();

        let outcome = done.await.unwrap();
        assert!(outcome.truncated);
        assert!(outcome.error.is_none());
        let data: Vec<_> = outcome.events.iter().map(|e| e.data.clone()).collect();
        assert_eq!(data, vec![json!(1), json!("partial")]);
    }

    #[tokio::test]
    async fn test_idle_timeout_ends_stream() {
        let (up_tx, up_rx) = mpsc::channel::<Result<Bytes, String>>(8);
        let (body, done) = tee(tokio_stream_from(up_rx), Some(Duration::from_millis(50)));
        up_tx.send(Ok(Bytes::from_static(b"data: 1\n\n"))).await.unwrap();

        let (received, failed) = collect(body).await;
        assert_eq!(received, b"data: 1\n\n".to_vec());
        assert!(failed);

        let outcome = done.await.unwrap();
        assert!(outcome.truncated);
        assert!(outcome.error.unwrap().contains("idle"));
        drop(up_tx);
    }

    #[tokio::test]
    async fn test_read_to_end() {
        let chunks: Vec<Result<Bytes, Infallible>> =
            vec![Ok(Bytes::from_static(b"{\"a\":")), Ok(Bytes::from_static(b"1}"))];
        let body = read_to_end(futures_util::stream::iter(chunks), None).await.unwrap();
        assert_eq!(&body[..], b"{\"a\":1}");
    }

    fn tokio_stream_from(
        rx: mpsc::Receiver<Result<Bytes, String>>,
    ) -> impl Stream<Item = Result<Bytes, String>> + Send + 'static {
        futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
    }
}
