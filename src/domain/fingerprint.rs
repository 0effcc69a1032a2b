//! Message-history fingerprints
//!
//! A conversation is canonicalised as a sequence of `(role, text)` pairs:
//! roles are lowercased, text parts are concatenated in order with non-text
//! content dropped, and trailing whitespace is trimmed. Each pair is encoded
//! as `len(role) role 0x1E len(text) text`, lengths as big-endian `u64`, and
//! pairs are separated by `0x1F`. The length prefixes keep separator bytes
//! inside message text from shifting a boundary. The SHA-256 of that byte
//! string is the fingerprint, so JSON formatting and key order never affect
//! it.

use crate::providers::constants::json_fields;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

const ROLE_SEPARATOR: u8 = 0x1E;
const ENTRY_SEPARATOR: u8 = 0x1F;

/// SHA-256 digest of a canonical message sequence
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageFingerprint([u8; 32]);

impl MessageFingerprint {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let array: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    /// Fingerprint of an empty conversation
    pub fn empty() -> Self {
        Self(Sha256::digest(b"").into())
    }
}

impl fmt::Debug for MessageFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageFingerprint({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for MessageFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for MessageFingerprint {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for MessageFingerprint {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Self::from_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid fingerprint"))
    }
}

/// One message reduced to what the fingerprint covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalMessage {
    pub role: String,
    pub text: String,
}

impl CanonicalMessage {
    pub fn from_value(message: &Value) -> Self {
        let role = message
            .get(json_fields::ROLE)
            .or_else(|| message.get(json_fields::TYPE))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase();

        let mut text = String::new();
        if let Some(content) = message.get(json_fields::CONTENT) {
            collect_text(content, &mut text);
        }
        let trimmed = text.trim_end().len();
        text.truncate(trimmed);

        Self { role, text }
    }

    fn write_to(&self, hasher: &mut Sha256) {
        write_field(hasher, &self.role);
        hasher.update([ROLE_SEPARATOR]);
        write_field(hasher, &self.text);
    }
}

fn write_field(hasher: &mut Sha256, field: &str) {
    hasher.update((field.len() as u64).to_be_bytes());
    hasher.update(field.as_bytes());
}

fn collect_text(content: &Value, out: &mut String) {
    match content {
        Value::String(s) => out.push_str(s),
        Value::Array(parts) => {
            for part in parts {
                match part {
                    Value::String(s) => out.push_str(s),
                    Value::Object(_) => {
                        let is_text = part
                            .get(json_fields::TYPE)
                            .and_then(Value::as_str)
                            .is_some_and(|t| json_fields::TEXT_PART_TYPES.contains(&t));
                        if is_text {
                            if let Some(s) = part.get(json_fields::TEXT).and_then(Value::as_str) {
                                out.push_str(s);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

/// The message list of a request body: `messages`, or `input` for the
/// OpenAI Responses API. A string `input` counts as one user message.
pub fn extract_messages(body: &Value) -> Vec<Value> {
    if let Some(Value::Array(messages)) = body.get(json_fields::MESSAGES) {
        return messages.clone();
    }
    match body.get(json_fields::INPUT) {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::String(text)) => vec![serde_json::json!({
            "role": "user",
            "content": text,
        })],
        _ => Vec::new(),
    }
}

pub fn canonicalize(messages: &[Value]) -> Vec<CanonicalMessage> {
    messages.iter().map(CanonicalMessage::from_value).collect()
}

/// Fingerprint of the whole message list
pub fn fingerprint(messages: &[Value]) -> MessageFingerprint {
    prefix_fingerprints(messages)
        .pop()
        .unwrap_or_else(MessageFingerprint::empty)
}

/// Fingerprints of every prefix of length `1..=N`, in order
pub fn prefix_fingerprints(messages: &[Value]) -> Vec<MessageFingerprint> {
    let mut hasher = Sha256::new();
    let mut prefixes = Vec::with_capacity(messages.len());

    for (i, message) in canonicalize(messages).iter().enumerate() {
        if i > 0 {
            hasher.update([ENTRY_SEPARATOR]);
        }
        message.write_to(&mut hasher);
        prefixes.push(MessageFingerprint(hasher.clone().finalize().into()));
    }

    prefixes
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn conversation() -> Vec<Value> {
        vec![
            json!({"role": "user", "content": "hi"}),
            json!({"role": "assistant", "content": [{"type": "text", "text": "hello"}]}),
            json!({"role": "user", "content": "more"}),
        ]
    }

    #[test]
    fn test_prefix_of_longer_conversation_matches() {
        let full = conversation();
        let prefixes = prefix_fingerprints(&full);
        assert_eq!(prefixes.len(), 3);
        assert_eq!(prefixes[0], fingerprint(&full[..1]));
        assert_eq!(prefixes[1], fingerprint(&full[..2]));
        assert_eq!(prefixes[2], fingerprint(&full));
    }

    #[test]
    fn test_key_order_and_formatting_do_not_matter() {
        let a: Vec<Value> =
            serde_json::from_str(r#"[{"role":"user","content":"hi"}]"#).unwrap();
        let b: Vec<Value> =
            serde_json::from_str("[\n  {\"content\": \"hi\",\n   \"role\": \"USER\"}\n]").unwrap();
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_string_and_part_content_are_equivalent() {
        let plain = vec![json!({"role": "user", "content": "hello world"})];
        let parts = vec![json!({"role": "user", "content": [
            {"type": "text", "text": "hello "},
            {"type": "image", "source": {"data": "..."}},
            {"type": "text", "text": "world  \n"}
        ]})];
        assert_eq!(fingerprint(&plain), fingerprint(&parts));
    }

    #[test]
    fn test_role_and_text_changes_are_detected() {
        let base = vec![json!({"role": "user", "content": "hi"})];
        let other_role = vec![json!({"role": "system", "content": "hi"})];
        let other_text = vec![json!({"role": "user", "content": "ho"})];
        assert_ne!(fingerprint(&base), fingerprint(&other_role));
        assert_ne!(fingerprint(&base), fingerprint(&other_text));
    }

    #[test]
    fn test_message_boundaries_are_significant() {
        let joined = vec![json!({"role": "user", "content": "ab"})];
        let split = vec![
            json!({"role": "user", "content": "a"}),
            json!({"role": "user", "content": "b"}),
        ];
        assert_ne!(fingerprint(&joined), fingerprint(&split));
    }

    #[rstest]
    #[case::entry_separator_in_text(
        vec![json!({"role": "user", "content": "a\u{1f}user\u{1e}b"})],
        vec![json!({"role": "user", "content": "a"}), json!({"role": "user", "content": "b"})]
    )]
    #[case::role_separator_in_role(
        vec![json!({"role": "user\u{1e}x", "content": "y"})],
        vec![json!({"role": "user", "content": "x\u{1e}y"})]
    )]
    fn test_separator_bytes_in_content_do_not_collide(#[case] left: Vec<Value>, #[case] right: Vec<Value>) {
        assert_ne!(fingerprint(&left), fingerprint(&right));
    }

    #[test]
    fn test_responses_api_input() {
        let body = json!({"input": [
            {"role": "user", "content": [{"type": "input_text", "text": "hi"}]},
            {"type": "function_call", "name": "ls", "arguments": "{}"}
        ]});
        let messages = extract_messages(&body);
        assert_eq!(messages.len(), 2);
        let canonical = canonicalize(&messages);
        assert_eq!(canonical[0].text, "hi");
        assert_eq!(canonical[1].role, "function_call");

        let string_input = extract_messages(&json!({"input": "hi"}));
        assert_eq!(
            fingerprint(&string_input),
            fingerprint(&[json!({"role": "user", "content": "hi"})])
        );
    }

    #[test]
    fn test_empty_history() {
        assert!(prefix_fingerprints(&[]).is_empty());
        assert_eq!(fingerprint(&[]), MessageFingerprint::empty());
        assert!(extract_messages(&json!({"model": "x"})).is_empty());
    }

    #[test]
    fn test_hex_round_trip() {
        let fp = fingerprint(&conversation());
        assert_eq!(MessageFingerprint::from_hex(&fp.to_hex()), Some(fp));
        assert_eq!(MessageFingerprint::from_hex("zz"), None);
    }
}
