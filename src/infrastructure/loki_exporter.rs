//! Remote log export to a Loki-compatible push endpoint
//!
//! The proxy path only ever calls [`LokiExporter::enqueue`], which never
//! waits: when the bounded queue is full the entry is dropped and counted.
//! A single worker task groups entries into one batch per label set and
//! pushes batches one at a time, retrying with capped exponential backoff
//! and full jitter. Exhausted batches are dropped and counted.

use crate::infrastructure::log_messages::exporter as msg;
use flate2::write::GzEncoder;
use flate2::Compression;
use nutype::nutype;
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Value of the `service` label on every stream
pub const SERVICE_LABEL: &str = "llm-proxy";

const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_CAP: Duration = Duration::from_secs(30);

/// Maximum entries per pushed batch
#[nutype(
    validate(greater = 0),
    derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize, AsRef)
)]
pub struct BatchSize(usize);

#[derive(Debug, Clone)]
pub struct LokiConfig {
    pub url: String,
    pub auth_token: Option<String>,
    pub batch_size: BatchSize,
    pub batch_wait: Duration,
    pub retry_max: u32,
    pub use_gzip: bool,
    pub environment: String,
    pub queue_capacity: usize,
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to encode push payload: {0}")]
    Encode(String),

    #[error("push request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("push rejected with status {0}")]
    Status(u16),
}

/// Labels that select the stream an entry is pushed to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamLabels {
    pub provider: String,
    pub upstream: String,
    pub transport: String,
}

/// One serialized log entry queued for export
#[derive(Debug, Clone)]
pub struct ExportRecord {
    pub labels: StreamLabels,
    pub timestamp_ns: i64,
    pub line: String,
}

#[derive(Debug, Default)]
struct ExporterStats {
    enqueued: AtomicU64,
    dropped_entries: AtomicU64,
    pushed_batches: AtomicU64,
    dropped_batches: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExporterStatsSnapshot {
    pub enabled: bool,
    pub enqueued: u64,
    pub dropped_entries: u64,
    pub pushed_batches: u64,
    pub dropped_batches: u64,
}

impl ExporterStatsSnapshot {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            enqueued: 0,
            dropped_entries: 0,
            pushed_batches: 0,
            dropped_batches: 0,
        }
    }
}

enum ExporterMessage {
    Entry(ExportRecord),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the export worker
pub struct LokiExporter {
    tx: mpsc::Sender<ExporterMessage>,
    stats: Arc<ExporterStats>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl LokiExporter {
    /// Start the worker on the current runtime
    pub fn spawn(config: LokiConfig, client: reqwest::Client) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let stats = Arc::new(ExporterStats::default());

        let worker = Worker {
            config,
            client,
            stats: Arc::clone(&stats),
            batches: HashMap::new(),
            rx,
        };
        let handle = tokio::spawn(worker.run());

        Self {
            tx,
            stats,
            worker: parking_lot::Mutex::new(Some(handle)),
        }
    }

    /// Queue an entry without waiting. Returns `false` if it was dropped.
    pub fn enqueue(&self, record: ExportRecord) -> bool {
        match self.tx.try_send(ExporterMessage::Entry(record)) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.stats.dropped_entries.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Push every pending batch and wait until done
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(ExporterMessage::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Flush and stop the worker, abandoning whatever is left after `grace`.
    /// Returns whether the queue drained in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let (done_tx, done_rx) = oneshot::channel();
        let drained = match tokio::time::timeout(grace, async {
            self.tx.send(ExporterMessage::Shutdown(done_tx)).await.is_ok()
                && done_rx.await.is_ok()
        })
        .await
        {
            Ok(drained) => drained,
            Err(_) => false,
        };

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if drained {
                let _ = handle.await;
            } else {
                warn!(grace_ms = grace.as_millis() as u64, "{}", msg::SHUTDOWN_ABANDONED);
                handle.abort();
            }
        }
        drained
    }

    pub fn stats(&self) -> ExporterStatsSnapshot {
        ExporterStatsSnapshot {
            enabled: true,
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            dropped_entries: self.stats.dropped_entries.load(Ordering::Relaxed),
            pushed_batches: self.stats.pushed_batches.load(Ordering::Relaxed),
            dropped_batches: self.stats.dropped_batches.load(Ordering::Relaxed),
        }
    }
}

struct Batch {
    values: Vec<(i64, String)>,
    opened_at: Instant,
}

struct Worker {
    config: LokiConfig,
    client: reqwest::Client,
    stats: Arc<ExporterStats>,
    batches: HashMap<StreamLabels, Batch>,
    rx: mpsc::Receiver<ExporterMessage>,
}

impl Worker {
    async fn run(mut self) {
        info!(url = %self.config.url, "{}", msg::WORKER_STARTED);
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(ExporterMessage::Entry(record)) => self.add(record).await,
                    Some(ExporterMessage::Flush(done)) => {
                        self.flush_all().await;
                        let _ = done.send(());
                    }
                    Some(ExporterMessage::Shutdown(done)) => {
                        self.flush_all().await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.flush_all().await;
                        break;
                    }
                },
                _ = sleep_until(deadline) => self.flush_expired().await,
            }
        }
        info!("{}", msg::WORKER_STOPPED);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.batches
            .values()
            .map(|batch| batch.opened_at + self.config.batch_wait)
            .min()
    }

    async fn add(&mut self, record: ExportRecord) {
        let batch_size = *self.config.batch_size.as_ref();
        let batch = self
            .batches
            .entry(record.labels.clone())
            .or_insert_with(|| Batch {
                values: Vec::with_capacity(batch_size),
                opened_at: Instant::now(),
            });
        batch.values.push((record.timestamp_ns, record.line));

        if batch.values.len() >= batch_size {
            if let Some(batch) = self.batches.remove(&record.labels) {
                self.push(&record.labels, batch).await;
            }
        }
    }

    async fn flush_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<StreamLabels> = self
            .batches
            .iter()
            .filter(|(_, batch)| batch.opened_at + self.config.batch_wait <= now)
            .map(|(labels, _)| labels.clone())
            .collect();

        for labels in expired {
            if let Some(batch) = self.batches.remove(&labels) {
                self.push(&labels, batch).await;
            }
        }
    }

    async fn flush_all(&mut self) {
        let mut pending: Vec<(StreamLabels, Batch)> = self.batches.drain().collect();
        pending.sort_by_key(|(_, batch)| batch.opened_at);
        for (labels, batch) in pending {
            self.push(&labels, batch).await;
        }
    }

    async fn push(&self, labels: &StreamLabels, batch: Batch) {
        let entries = batch.values.len();
        let body = match self.encode(labels, &batch.values) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, entries, "{}", msg::BATCH_DROPPED);
                self.stats.dropped_batches.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let mut attempt = 0;
        loop {
            match self.send(body.clone()).await {
                Ok(()) => {
                    debug!(entries, attempt, "{}", msg::BATCH_PUSHED);
                    self.stats.pushed_batches.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) if attempt < self.config.retry_max => {
                    let delay = backoff_delay(attempt);
                    debug!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "{}", msg::PUSH_RETRY);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(error = %e, entries, attempts = attempt + 1, "{}", msg::BATCH_DROPPED);
                    self.stats.dropped_batches.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        }
    }

    fn encode(&self, labels: &StreamLabels, values: &[(i64, String)]) -> Result<Vec<u8>, ExportError> {
        let payload = build_payload(&self.config.environment, labels, values);
        let json = serde_json::to_vec(&payload).map_err(|e| ExportError::Encode(e.to_string()))?;
        if self.config.use_gzip {
            gzip(&json)
        } else {
            Ok(json)
        }
    }

    async fn send(&self, body: Vec<u8>) -> Result<(), ExportError> {
        let mut request = self
            .client
            .post(&self.config.url)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body);
        if self.config.use_gzip {
            request = request.header(http::header::CONTENT_ENCODING, "gzip");
        }
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ExportError::Status(status.as_u16()))
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Full-jitter backoff: uniform in `[0, min(cap, base * 2^attempt)]`
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = RETRY_BASE
        .saturating_mul(2u32.saturating_pow(attempt.min(16)))
        .min(RETRY_CAP);
    let millis = rand::thread_rng().gen_range(0..=exp.as_millis() as u64);
    Duration::from_millis(millis)
}

/// Push payload for one stream
pub fn build_payload(
    environment: &str,
    labels: &StreamLabels,
    values: &[(i64, String)],
) -> serde_json::Value {
    let values: Vec<[String; 2]> = values
        .iter()
        .map(|(ts, line)| [ts.to_string(), line.clone()])
        .collect();
    json!({
        "streams": [{
            "stream": {
                "service": SERVICE_LABEL,
                "provider": labels.provider,
                "upstream": labels.upstream,
                "environment": environment,
                "transport": labels.transport,
            },
            "values": values,
        }]
    })
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>, ExportError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .map_err(|e| ExportError::Encode(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| ExportError::Encode(e.to_string()))
}
