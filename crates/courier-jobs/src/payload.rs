//! Job payloads and their wire encoding.
//!
//! In process a payload is a JSON object. Crossing a durable backend it is
//! UTF-8 JSON bytes.

use crate::error::{JobError, JobResult};
use serde::de::Error as _;
use serde_json::{Map, Value};

/// Opaque key/value job payload.
pub type Payload = Map<String, Value>;

/// Attempt counter stamped onto requeued payloads.
pub const RETRY_COUNT_KEY: &str = "_retry_count";

/// Message of the failure that caused the last requeue.
pub const LAST_ERROR_KEY: &str = "_last_error";

/// A message as returned by a queue backend.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueMessage {
    /// Byte-encoded payload from a durable backend.
    Encoded(Vec<u8>),
    /// Payload that never left the process.
    Structured(Payload),
}

impl QueueMessage {
    /// Normalizes the message into a payload.
    ///
    /// Fails if the bytes are not a JSON object.
    pub fn into_payload(self) -> JobResult<Payload> {
        match self {
            QueueMessage::Structured(payload) => Ok(payload),
            QueueMessage::Encoded(bytes) => decode_payload(&bytes),
        }
    }
}

/// Encodes a payload for a durable backend.
pub fn encode_payload(payload: &Payload) -> JobResult<Vec<u8>> {
    Ok(serde_json::to_vec(payload)?)
}

/// Decodes bytes produced by [`encode_payload`] or any JSON object producer.
pub fn decode_payload(bytes: &[u8]) -> JobResult<Payload> {
    match serde_json::from_slice::<Value>(bytes)? {
        Value::Object(map) => Ok(map),
        other => Err(JobError::Serialization(serde_json::Error::custom(format!(
            "queue message is not a JSON object (found {})",
            json_kind(&other)
        )))),
    }
}

/// Number of requeues the payload has gone through.
pub fn retry_count(payload: &Payload) -> u32 {
    payload
        .get(RETRY_COUNT_KEY)
        .and_then(Value::as_u64)
        .map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_encoded_and_structured_normalize_equally() {
        let original = payload(json!({"image": "a.png", "sizes": [64, 128], "crop": true}));
        let bytes = encode_payload(&original).unwrap();

        assert_eq!(QueueMessage::Encoded(bytes).into_payload().unwrap(), original);
        assert_eq!(QueueMessage::Structured(original.clone()).into_payload().unwrap(), original);
    }

    #[test]
    fn test_non_object_is_rejected() {
        let err = QueueMessage::Encoded(b"[1,2,3]".to_vec()).into_payload().unwrap_err();
        assert!(matches!(err, JobError::Serialization(_)));
        assert!(err.to_string().contains("array"));

        let err = decode_payload(b"\"just a string\"").unwrap_err();
        assert!(matches!(err, JobError::Serialization(_)));
    }

    #[test]
    fn test_invalid_json_is_serialization_error() {
        let err = decode_payload(b"not json").unwrap_err();
        assert!(matches!(err, JobError::Serialization(_)));
    }

    #[test]
    fn test_retry_count_defaults_to_zero() {
        assert_eq!(retry_count(&payload(json!({"to": "a@b.c"}))), 0);
        assert_eq!(retry_count(&payload(json!({"_retry_count": 2}))), 2);
        assert_eq!(retry_count(&payload(json!({"_retry_count": "two"}))), 0);
    }
}
