//! AWS eventstream decoding for the logging tee
//!
//! Wire format of one message (all integers big-endian):
//!
//! ```text
//! [total_len u32][headers_len u32][prelude_crc u32][headers][payload][message_crc u32]
//! ```
//!
//! The decoder only ever sees a copy of the bytes sent to the client, so a
//! framing error here stops decoding for the rest of the stream but cannot
//! affect what the client receives.

use crate::domain::log_entry::StreamEvent;
use crate::providers::bedrock::health::BedrockHealth;
use crate::providers::constants::json_fields;
use crate::proxy::streaming::CaptureAccumulator;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

const PRELUDE_LEN: usize = 12;
const MESSAGE_CRC_LEN: usize = 4;
const MIN_MESSAGE_LEN: usize = PRELUDE_LEN + MESSAGE_CRC_LEN;
const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

pub const MESSAGE_TYPE: &str = ":message-type";
pub const EVENT_TYPE: &str = ":event-type";
pub const EXCEPTION_TYPE: &str = ":exception-type";
pub const ERROR_CODE: &str = ":error-code";
pub const ERROR_MESSAGE: &str = ":error-message";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("prelude checksum mismatch (expected {expected:#010x}, got {actual:#010x})")]
    PreludeChecksum { expected: u32, actual: u32 },

    #[error("message checksum mismatch (expected {expected:#010x}, got {actual:#010x})")]
    MessageChecksum { expected: u32, actual: u32 },

    #[error("invalid message length {total} (headers {headers})")]
    Length { total: usize, headers: usize },

    #[error("truncated header block")]
    TruncatedHeader,

    #[error("unknown header value type {0}")]
    HeaderType(u8),

    #[error("header is not valid UTF-8")]
    HeaderUtf8,

    #[error("invalid chunk payload: {0}")]
    Payload(String),
}

/// Typed eventstream header value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameHeaderValue {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Bytes(Vec<u8>),
    String(String),
    Timestamp(i64),
    Uuid([u8; 16]),
}

impl FrameHeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

/// One decoded eventstream message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub headers: Vec<(String, FrameHeaderValue)>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn header(&self, name: &str) -> Option<&FrameHeaderValue> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.header(name).and_then(FrameHeaderValue::as_str)
    }
}

/// Incremental eventstream frame parser
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
    poisoned: bool,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every frame completed by them.
    ///
    /// After the first framing error the decoder is poisoned and ignores
    /// further input.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<Frame, DecodeError>> {
        if self.poisoned {
            return Vec::new();
        }
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        loop {
            match self.next_frame() {
                Ok(Some(frame)) => frames.push(Ok(frame)),
                Ok(None) => break,
                Err(e) => {
                    self.poisoned = true;
                    self.buffer.clear();
                    frames.push(Err(e));
                    break;
                }
            }
        }
        frames
    }

    /// No partial frame is buffered
    pub fn at_boundary(&self) -> bool {
        self.poisoned || self.buffer.is_empty()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, DecodeError> {
        if self.buffer.len() < PRELUDE_LEN {
            return Ok(None);
        }

        let total = read_u32(&self.buffer[0..4]) as usize;
        let headers_len = read_u32(&self.buffer[4..8]) as usize;
        let prelude_crc = read_u32(&self.buffer[8..12]);

        let computed = crc32fast::hash(&self.buffer[..8]);
        if computed != prelude_crc {
            return Err(DecodeError::PreludeChecksum {
                expected: prelude_crc,
                actual: computed,
            });
        }
        if !(MIN_MESSAGE_LEN..=MAX_MESSAGE_LEN).contains(&total)
            || headers_len > total - MIN_MESSAGE_LEN
        {
            return Err(DecodeError::Length {
                total,
                headers: headers_len,
            });
        }
        if self.buffer.len() < total {
            return Ok(None);
        }

        let message: Vec<u8> = self.buffer.drain(..total).collect();
        let message_crc = read_u32(&message[total - MESSAGE_CRC_LEN..]);
        let computed = crc32fast::hash(&message[..total - MESSAGE_CRC_LEN]);
        if computed != message_crc {
            return Err(DecodeError::MessageChecksum {
                expected: message_crc,
                actual: computed,
            });
        }

        let headers_end = PRELUDE_LEN + headers_len;
        let headers = parse_headers(&message[PRELUDE_LEN..headers_end])?;
        let payload = message[headers_end..total - MESSAGE_CRC_LEN].to_vec();

        Ok(Some(Frame { headers, payload }))
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn take<'a>(block: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], DecodeError> {
    let end = pos.checked_add(len).ok_or(DecodeError::TruncatedHeader)?;
    let slice = block.get(*pos..end).ok_or(DecodeError::TruncatedHeader)?;
    *pos = end;
    Ok(slice)
}

fn parse_headers(block: &[u8]) -> Result<Vec<(String, FrameHeaderValue)>, DecodeError> {
    let mut headers = Vec::new();
    let mut pos = 0;

    while pos < block.len() {
        let name_len = take(block, &mut pos, 1)?[0] as usize;
        let name = std::str::from_utf8(take(block, &mut pos, name_len)?)
            .map_err(|_| DecodeError::HeaderUtf8)?
            .to_string();
        let value_type = take(block, &mut pos, 1)?[0];

        let value = match value_type {
            0 => FrameHeaderValue::Bool(true),
            1 => FrameHeaderValue::Bool(false),
            2 => FrameHeaderValue::Byte(take(block, &mut pos, 1)?[0] as i8),
            3 => {
                let b = take(block, &mut pos, 2)?;
                FrameHeaderValue::Short(i16::from_be_bytes([b[0], b[1]]))
            }
            4 => {
                let b = take(block, &mut pos, 4)?;
                FrameHeaderValue::Int(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            }
            5 | 8 => {
                let b = take(block, &mut pos, 8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                let v = i64::from_be_bytes(raw);
                if value_type == 5 {
                    FrameHeaderValue::Long(v)
                } else {
                    FrameHeaderValue::Timestamp(v)
                }
            }
            6 | 7 => {
                let b = take(block, &mut pos, 2)?;
                let len = u16::from_be_bytes([b[0], b[1]]) as usize;
                let raw = take(block, &mut pos, len)?;
                if value_type == 6 {
                    FrameHeaderValue::Bytes(raw.to_vec())
                } else {
                    FrameHeaderValue::String(
                        std::str::from_utf8(raw)
                            .map_err(|_| DecodeError::HeaderUtf8)?
                            .to_string(),
                    )
                }
            }
            9 => {
                let mut uuid = [0u8; 16];
                uuid.copy_from_slice(take(block, &mut pos, 16)?);
                FrameHeaderValue::Uuid(uuid)
            }
            other => return Err(DecodeError::HeaderType(other)),
        };

        headers.push((name, value));
    }

    Ok(headers)
}

fn payload_json(payload: &[u8]) -> Value {
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()))
}

/// Turn a frame into the logged event, if it carries one.
///
/// `chunk` events wrap the model's own event as base64 JSON under `bytes`;
/// the inner JSON is logged with its `type` as the event name.
pub fn frame_to_event(frame: &Frame) -> Result<Option<StreamEvent>, DecodeError> {
    match frame.header_str(MESSAGE_TYPE) {
        Some("event") => {
            let event_type = frame.header_str(EVENT_TYPE).unwrap_or("event");
            let outer = payload_json(&frame.payload);

            if event_type == "chunk" {
                let encoded = outer
                    .get(json_fields::BYTES)
                    .and_then(Value::as_str)
                    .ok_or_else(|| DecodeError::Payload("chunk without bytes".to_string()))?;
                let decoded = BASE64
                    .decode(encoded)
                    .map_err(|e| DecodeError::Payload(e.to_string()))?;
                let inner = payload_json(&decoded);
                let name = inner
                    .get(json_fields::TYPE)
                    .and_then(Value::as_str)
                    .unwrap_or(event_type)
                    .to_string();
                Ok(Some(StreamEvent::new(Some(name), inner)))
            } else {
                Ok(Some(StreamEvent::new(Some(event_type.to_string()), outer)))
            }
        }
        Some("exception") => {
            let exception = frame.header_str(EXCEPTION_TYPE).unwrap_or("unknown");
            Ok(Some(StreamEvent::new(
                Some(format!("exception:{exception}")),
                payload_json(&frame.payload),
            )))
        }
        Some("error") => {
            let code = frame.header_str(ERROR_CODE).unwrap_or("unknown");
            let message = frame.header_str(ERROR_MESSAGE).unwrap_or_default();
            Ok(Some(StreamEvent::new(
                Some(format!("error:{code}")),
                Value::String(message.to_string()),
            )))
        }
        _ => Ok(None),
    }
}

/// Encode one message with string headers.
///
/// The proxy never writes eventstream itself; mock upstreams use this.
pub fn encode_frame(headers: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
    let mut headers_buf = Vec::new();
    for &(name, value) in headers {
        headers_buf.push(name.len() as u8);
        headers_buf.extend_from_slice(name.as_bytes());
        headers_buf.push(7);
        headers_buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
        headers_buf.extend_from_slice(value.as_bytes());
    }

    let total = MIN_MESSAGE_LEN + headers_buf.len() + payload.len();
    let mut message = Vec::with_capacity(total);
    message.extend_from_slice(&(total as u32).to_be_bytes());
    message.extend_from_slice(&(headers_buf.len() as u32).to_be_bytes());
    let prelude_crc = crc32fast::hash(&message[..8]);
    message.extend_from_slice(&prelude_crc.to_be_bytes());
    message.extend_from_slice(&headers_buf);
    message.extend_from_slice(payload);
    let message_crc = crc32fast::hash(&message);
    message.extend_from_slice(&message_crc.to_be_bytes());
    message
}

/// Encode a Bedrock `chunk` event wrapping `inner_json`
pub fn encode_chunk(inner_json: &str) -> Vec<u8> {
    let payload = serde_json::json!({ "bytes": BASE64.encode(inner_json) });
    encode_frame(
        &[
            (MESSAGE_TYPE, "event"),
            (EVENT_TYPE, "chunk"),
            (":content-type", "application/json"),
        ],
        payload.to_string().as_bytes(),
    )
}

/// Logging accumulator for `application/vnd.amazon.eventstream` bodies
pub struct EventStreamAccumulator {
    decoder: EventStreamDecoder,
    events: Vec<StreamEvent>,
    health: Arc<BedrockHealth>,
    /// Bytes received after a framing error, never decoded
    skipped: usize,
}

impl EventStreamAccumulator {
    pub fn new(health: Arc<BedrockHealth>) -> Self {
        Self {
            decoder: EventStreamDecoder::new(),
            events: Vec::new(),
            health,
            skipped: 0,
        }
    }
}

impl CaptureAccumulator for EventStreamAccumulator {
    fn feed(&mut self, chunk: &[u8]) {
        if self.decoder.is_poisoned() {
            self.skipped += chunk.len();
            return;
        }
        for result in self.decoder.feed(chunk) {
            match result.and_then(|frame| frame_to_event(&frame)) {
                Ok(Some(event)) => self.events.push(event),
                Ok(None) => {}
                Err(e) => {
                    self.health.record_decode_error();
                    warn!(error = %e, "Bedrock eventstream decode error");
                }
            }
        }
    }

    fn at_boundary(&self) -> bool {
        self.decoder.at_boundary()
    }

    fn finish(self: Box<Self>) -> Vec<StreamEvent> {
        if self.decoder.is_poisoned() {
            debug!(
                events = self.events.len(),
                skipped_bytes = self.skipped,
                "Eventstream capture stopped at first framing error"
            );
        }
        self.events
    }
}
