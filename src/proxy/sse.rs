//! Server-sent-event accumulation for the logging tee

use crate::domain::log_entry::StreamEvent;
use crate::proxy::streaming::CaptureAccumulator;
use serde_json::Value;

/// Collects `text/event-stream` events as they complete.
///
/// Bytes are buffered until a full line is available, so multi-byte
/// characters split across chunks decode correctly. `data` is stored as JSON
/// when it parses, as a string otherwise.
#[derive(Debug, Default)]
pub struct SseAccumulator {
    buffer: Vec<u8>,
    event: Option<String>,
    data_lines: Vec<String>,
    pending: bool,
    events: Vec<StreamEvent>,
}

impl SseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[StreamEvent] {
        &self.events
    }

    fn process_line(&mut self, line: &str) {
        if line.is_empty() {
            self.finish_event();
            return;
        }
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => {
                self.event = (!value.is_empty()).then(|| value.to_string());
                self.pending = true;
            }
            "data" => {
                self.data_lines.push(value.to_string());
                self.pending = true;
            }
            "id" | "retry" => self.pending = true,
            _ => {}
        }
    }

    fn finish_event(&mut self) {
        self.pending = false;
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        let data = self.data_lines.join("\n");
        self.data_lines.clear();
        let data = serde_json::from_str::<Value>(&data).unwrap_or(Value::String(data));
        self.events.push(StreamEvent::new(self.event.take(), data));
    }
}

impl CaptureAccumulator for SseAccumulator {
    fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let mut line = &self.buffer[start..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            let line = String::from_utf8_lossy(line).into_owned();
            start = end + 1;
            self.process_line(&line);
        }
        self.buffer.drain(..start);
    }

    fn at_boundary(&self) -> bool {
        self.buffer.is_empty() && !self.pending
    }

    /// A trailing event without its blank line is kept
    fn finish(mut self: Box<Self>) -> Vec<StreamEvent> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
            self.process_line(&line);
        }
        self.finish_event();
        self.events
    }
}
