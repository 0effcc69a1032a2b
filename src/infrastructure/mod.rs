//! Infrastructure layer for llm-proxy
//!
//! Implementations of the external concerns: the session database, the
//! per-session log files, the remote log exporter and the sink that ties
//! them together.

pub mod database;
pub mod file_logger;
pub mod log_messages;
pub mod loki_exporter;
pub mod multi_sink;
pub mod redaction;

pub use database::SessionStore;
pub use file_logger::{FileLogger, LogWriteError};
pub use loki_exporter::{BatchSize, ExporterStatsSnapshot, LokiConfig, LokiExporter};
pub use multi_sink::MultiSinkWriter;
pub use redaction::Redactor;
