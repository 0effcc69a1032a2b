//! Fan-out of session log entries to the file logger and remote exporter
//!
//! The file write is synchronous so that file order follows emit order.
//! Errors never reach the caller: they are counted and reported through
//! `tracing` at most once per reporting interval.

use crate::domain::log_entry::LogEntry;
use crate::infrastructure::file_logger::{FileLogger, LogWriteError};
use crate::infrastructure::log_messages::sink as msg;
use crate::infrastructure::loki_exporter::{
    ExportRecord, ExporterStatsSnapshot, LokiExporter, StreamLabels,
};
use crate::infrastructure::redaction::Redactor;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::error;

const ERROR_REPORT_INTERVAL: Duration = Duration::from_secs(60);
const UNKNOWN_PROVIDER_LABEL: &str = "unknown";

/// Reports a recurring error at most once per interval
struct RateLimitedReporter {
    interval: Duration,
    last_report: Mutex<Option<Instant>>,
    suppressed: AtomicU64,
}

impl RateLimitedReporter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_report: Mutex::new(None),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Returns the number of reports suppressed since the last one if this
    /// call should report, `None` otherwise
    fn should_report(&self) -> Option<u64> {
        let now = Instant::now();
        let mut last = self.last_report.lock();
        match *last {
            Some(at) if now.duration_since(at) < self.interval => {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                None
            }
            _ => {
                *last = Some(now);
                Some(self.suppressed.swap(0, Ordering::Relaxed))
            }
        }
    }
}

/// Writes every entry to the session file and, if configured, the exporter
pub struct MultiSinkWriter {
    files: FileLogger,
    exporter: Option<Arc<LokiExporter>>,
    redactor: Redactor,
    write_errors: AtomicU64,
    reporter: RateLimitedReporter,
}

impl MultiSinkWriter {
    pub fn new(files: FileLogger, exporter: Option<Arc<LokiExporter>>, redactor: Redactor) -> Self {
        Self {
            files,
            exporter,
            redactor,
            write_errors: AtomicU64::new(0),
            reporter: RateLimitedReporter::new(ERROR_REPORT_INTERVAL),
        }
    }

    /// Redact, write to the session file, then enqueue for export
    pub fn emit(&self, mut entry: LogEntry) {
        if let Some(headers) = entry.headers_mut() {
            self.redactor.redact(headers);
        }

        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                self.record_error(&entry, &LogWriteError::from(e));
                return;
            }
        };

        if let Err(e) = self.files.write_line(&entry, &line) {
            self.record_error(&entry, &e);
        }

        if let Some(exporter) = &self.exporter {
            exporter.enqueue(ExportRecord {
                labels: StreamLabels {
                    provider: entry
                        .provider
                        .map(|provider| provider.to_string())
                        .unwrap_or_else(|| UNKNOWN_PROVIDER_LABEL.to_string()),
                    upstream: entry.upstream_host.clone(),
                    transport: entry.transport.to_string(),
                },
                timestamp_ns: entry
                    .timestamp
                    .timestamp_nanos_opt()
                    .unwrap_or_else(|| entry.timestamp.timestamp_micros().saturating_mul(1000)),
                line,
            });
        }
    }

    pub fn files(&self) -> &FileLogger {
        &self.files
    }

    pub fn exporter(&self) -> Option<&Arc<LokiExporter>> {
        self.exporter.as_ref()
    }

    pub fn exporter_stats(&self) -> ExporterStatsSnapshot {
        self.exporter
            .as_ref()
            .map(|exporter| exporter.stats())
            .unwrap_or_else(ExporterStatsSnapshot::disabled)
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }

    fn record_error(&self, entry: &LogEntry, e: &LogWriteError) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
        if let Some(suppressed) = self.reporter.should_report() {
            let message = match e {
                LogWriteError::Serialize(_) => msg::SERIALIZE_FAILED,
                LogWriteError::Io { .. } => msg::WRITE_FAILED,
            };
            error!(
                error = %e,
                session_id = %entry.session_id,
                entry_type = entry.kind.name(),
                suppressed,
                "{}",
                message
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::log_entry::{
        EntryContext, LogEntryKind, LoggedHeaders, RequestRecord,
    };
    use crate::providers::{Provider, Transport};

    fn request_entry(session: &str) -> LogEntry {
        let mut headers = LoggedHeaders::new();
        headers.insert("x-api-key".to_string(), "sk-ant-api03-verysecret".to_string());
        headers.insert("accept".to_string(), "application/json".to_string());
        EntryContext {
            machine_id: "m".to_string(),
            session_id: session.to_string(),
            upstream_host: "api.anthropic.com".to_string(),
            provider: Some(Provider::Anthropic),
            transport: Transport::Http,
            request_id: None,
        }
        .entry(
            1,
            LogEntryKind::Request(RequestRecord {
                method: "POST".to_string(),
                url: "https://api.anthropic.com/v1/messages".to_string(),
                headers,
                body: None,
                rejected: false,
                error: None,
            }),
        )
    }

    #[test]
    fn test_emit_redacts_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let sink = MultiSinkWriter::new(FileLogger::new(dir.path(), 4), None, Redactor::default());

        sink.emit(request_entry("s1"));

        let path = sink.files().path_for("api.anthropic.com", "s1", chrono::Utc::now());
        let contents = std::fs::read_to_string(path).unwrap();
        assert!(!contents.contains("sk-ant-api03-verysecret"));
        assert!(contents.contains("redacted(len=23)"));
        assert!(contents.contains("application/json"));
        assert_eq!(sink.write_errors(), 0);
    }

    #[test]
    fn test_write_errors_are_counted_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let sink = MultiSinkWriter::new(FileLogger::new(&blocker, 4), None, Redactor::default());

        sink.emit(request_entry("s1"));
        sink.emit(request_entry("s1"));

        assert_eq!(sink.write_errors(), 2);
        assert!(!sink.exporter_stats().enabled);
    }

    #[test]
    fn test_reporter_suppresses_within_interval() {
        let reporter = RateLimitedReporter::new(Duration::from_secs(60));
        assert_eq!(reporter.should_report(), Some(0));
        assert_eq!(reporter.should_report(), None);
        assert_eq!(reporter.should_report(), None);

        let reporter = RateLimitedReporter::new(Duration::ZERO);
        assert_eq!(reporter.should_report(), Some(0));
        assert_eq!(reporter.should_report(), Some(0));
    }
}
