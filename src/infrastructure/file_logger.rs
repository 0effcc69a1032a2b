//! Per-session append-only JSONL files
//!
//! Layout: `<root>/<upstream-host>/<YYYY-MM-DD>/<session-id>.jsonl`. For a
//! tracked session the date is the one stamped into its id, so a session
//! that runs past midnight keeps writing to the same file. Any other id
//! (rejected requests) is filed under the day of each entry.
//!
//! The handle table lock only covers lookup and insertion; writes happen
//! under the lock of the file being written.

use crate::domain::log_entry::LogEntry;
use crate::domain::session::InternalSessionId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LogWriteError {
    #[error("failed to serialize log entry: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

struct OpenHandle {
    file: Mutex<File>,
    last_used: AtomicU64,
}

/// Writes each session's entries to its own file
pub struct FileLogger {
    root: PathBuf,
    max_open_files: usize,
    open: Mutex<HashMap<PathBuf, Arc<OpenHandle>>>,
    clock: AtomicU64,
}

impl FileLogger {
    pub fn new(root: impl Into<PathBuf>, max_open_files: usize) -> Self {
        Self {
            root: root.into(),
            max_open_files: max_open_files.max(1),
            open: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Serialize and append one entry
    pub fn write(&self, entry: &LogEntry) -> Result<PathBuf, LogWriteError> {
        let line = serde_json::to_string(entry)?;
        self.write_line(entry, &line)
    }

    /// Append an already serialized entry; `line` must not contain newlines
    pub fn write_line(&self, entry: &LogEntry, line: &str) -> Result<PathBuf, LogWriteError> {
        let path = self.path_for(&entry.upstream_host, &entry.session_id, entry.timestamp);
        let handle = self.handle_for(&path).map_err(|source| LogWriteError::Io {
            path: path.clone(),
            source,
        })?;

        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');

        let result = {
            let mut file = handle.file.lock();
            file.write_all(&buf).and_then(|()| file.flush())
        };

        if let Err(source) = result {
            self.discard(&path, &handle);
            return Err(LogWriteError::Io { path, source });
        }

        Ok(path)
    }

    /// File an entry for `session_id` written at `at` goes to
    pub fn path_for(&self, upstream_host: &str, session_id: &str, at: DateTime<Utc>) -> PathBuf {
        let day = InternalSessionId::try_new(session_id.to_string())
            .ok()
            .and_then(|id| id.date())
            .unwrap_or_else(|| at.date_naive());
        self.root
            .join(safe_component(upstream_host))
            .join(day.format("%Y-%m-%d").to_string())
            .join(format!("{}.jsonl", safe_component(session_id)))
    }

    #[cfg(test)]
    fn open_files(&self) -> usize {
        self.open.lock().len()
    }

    fn handle_for(&self, path: &Path) -> io::Result<Arc<OpenHandle>> {
        let now = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(handle) = self.open.lock().get(path) {
            handle.last_used.store(now, Ordering::Relaxed);
            return Ok(Arc::clone(handle));
        }

        let opened = Arc::new(OpenHandle {
            file: Mutex::new(open_append(path)?),
            last_used: AtomicU64::new(now),
        });

        let mut open = self.open.lock();
        if let Some(existing) = open.get(path) {
            existing.last_used.store(now, Ordering::Relaxed);
            return Ok(Arc::clone(existing));
        }
        if open.len() >= self.max_open_files {
            evict_least_recent(&mut open);
        }
        open.insert(path.to_path_buf(), Arc::clone(&opened));
        Ok(opened)
    }

    /// Forget a handle that failed, unless it was already replaced
    fn discard(&self, path: &Path, handle: &Arc<OpenHandle>) {
        let mut open = self.open.lock();
        if open.get(path).is_some_and(|current| Arc::ptr_eq(current, handle)) {
            open.remove(path);
        }
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn evict_least_recent(open: &mut HashMap<PathBuf, Arc<OpenHandle>>) {
    let oldest = open
        .iter()
        .min_by_key(|(_, handle)| handle.last_used.load(Ordering::Relaxed))
        .map(|(path, _)| path.clone());
    if let Some(path) = oldest {
        debug!(path = %path.display(), "Closing least recently written session log");
        open.remove(&path);
    }
}

/// Make a string safe to use as a single path component
fn safe_component(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned
    }
}
