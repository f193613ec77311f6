//! Event sanitization for relational persistence.
//!
//! The event log rejects NUL bytes (PostgreSQL text columns) and has no
//! business storing multi-kilobyte inline images, so events are cleaned
//! before they reach the persistence batcher. Streaming delivery always
//! carries the original event; only the durable mirror is sanitized.

use serde_json::Value;

use super::WorkflowEvent;

/// Strings longer than this are candidates for base64 truncation.
const BASE64_TRUNCATE_BYTES: usize = 1024;

/// Payload keys that carry image data by convention.
const IMAGE_KEYS: &[&str] = &[
    "image",
    "image_data",
    "image_base64",
    "screenshot",
    "thumbnail",
];

/// Return a sanitized copy of an event suitable for the event log.
#[must_use]
pub fn sanitize_event(event: &WorkflowEvent) -> WorkflowEvent {
    let mut clean = event.clone();
    if let Some(message) = clean.message.take() {
        clean.message = Some(clean_text(&message));
    }

    let payload = std::mem::take(&mut clean.payload);
    clean.payload = payload
        .into_iter()
        .map(|(key, value)| {
            let force = IMAGE_KEYS.contains(&key.as_str());
            (key, sanitize_value(value, force))
        })
        .collect();
    clean
}

/// Remove characters the relational store cannot hold.
///
/// NUL bytes and stray C0 control characters are dropped; newlines and tabs
/// survive. Replacement characters left over from lossy UTF-8 decoding at
/// the ingest boundary are stripped as well.
#[must_use]
pub fn clean_text(input: &str) -> String {
    input
        .chars()
        .filter(|c| {
            !matches!(c, '\u{0}'..='\u{8}' | '\u{b}' | '\u{c}' | '\u{e}'..='\u{1f}' | '\u{fffd}')
        })
        .collect()
}

fn sanitize_value(value: Value, force_truncate: bool) -> Value {
    match value {
        Value::String(s) => sanitize_string(s, force_truncate),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| sanitize_value(v, force_truncate))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    let force = force_truncate || IMAGE_KEYS.contains(&key.as_str());
                    (key, sanitize_value(value, force))
                })
                .collect(),
        ),
        other => other,
    }
}

fn sanitize_string(s: String, force_truncate: bool) -> Value {
    if s.len() > BASE64_TRUNCATE_BYTES && (force_truncate || looks_like_base64(&s)) {
        return Value::String(format!("[base64 omitted: {} bytes]", s.len()));
    }
    Value::String(clean_text(&s))
}

/// Heuristic base64 detector for large inline blobs.
///
/// Data URLs are always treated as base64. Otherwise the whole string must
/// be drawn from the base64 alphabet (padding and line breaks included).
fn looks_like_base64(s: &str) -> bool {
    if s.starts_with("data:image/") || s.starts_with("data:application/") {
        return true;
    }
    s.bytes().all(|b| {
        b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=' | b'\r' | b'\n')
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types;

    fn event_with_payload(payload: serde_json::Map<String, Value>) -> WorkflowEvent {
        WorkflowEvent::new("wf-1", types::TOOL_OBSERVATION).with_payload(payload)
    }

    #[test]
    fn test_clean_text_strips_nul_and_controls() {
        assert_eq!(clean_text("he\u{0}llo\u{1}"), "hello");
        assert_eq!(clean_text("line1\nline2\ttab"), "line1\nline2\ttab");
        assert_eq!(clean_text("bad\u{fffd}byte"), "badbyte");
    }

    #[test]
    fn test_large_base64_blob_replaced() {
        let blob = "QUJD".repeat(600); // 2400 bytes of base64 alphabet
        let mut payload = serde_json::Map::new();
        payload.insert("result".into(), Value::String(blob.clone()));

        let clean = sanitize_event(&event_with_payload(payload));
        assert_eq!(
            clean.payload["result"],
            format!("[base64 omitted: {} bytes]", blob.len())
        );
    }

    #[test]
    fn test_large_prose_kept() {
        let prose = "the quick brown fox jumps over the lazy dog. ".repeat(60);
        let mut payload = serde_json::Map::new();
        payload.insert("summary".into(), Value::String(prose.clone()));

        let clean = sanitize_event(&event_with_payload(payload));
        assert_eq!(clean.payload["summary"], prose);
    }

    #[test]
    fn test_image_key_truncated_even_without_base64_shape() {
        let big = "x y z ".repeat(300);
        let mut payload = serde_json::Map::new();
        payload.insert("screenshot".into(), Value::String(big.clone()));

        let clean = sanitize_event(&event_with_payload(payload));
        assert_eq!(
            clean.payload["screenshot"],
            format!("[base64 omitted: {} bytes]", big.len())
        );
    }

    #[test]
    fn test_small_strings_untouched() {
        let mut payload = serde_json::Map::new();
        payload.insert("note".into(), Value::String("short".into()));

        let clean = sanitize_event(&event_with_payload(payload));
        assert_eq!(clean.payload["note"], "short");
    }

    #[test]
    fn test_nested_payload_sanitized() {
        let blob = "YWJj".repeat(500);
        let nested = serde_json::json!({ "inner": { "data": blob } });
        let mut payload = serde_json::Map::new();
        payload.insert("tool".into(), nested);

        let clean = sanitize_event(&event_with_payload(payload));
        let inner = &clean.payload["tool"]["inner"]["data"];
        assert!(inner.as_str().unwrap().starts_with("[base64 omitted:"));
    }
}
