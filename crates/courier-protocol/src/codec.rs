//! Codec for encoding and decoding Courier envelopes.
//!
//! The wire format is one JSON envelope per WebSocket text frame, so no
//! length prefix is needed; the codec only enforces the size ceiling and
//! maps serde failures into protocol errors.

use bytes::Bytes;
use thiserror::Error;

use crate::envelope::Envelope;

/// Maximum encoded envelope size (1 MiB).
pub const MAX_ENVELOPE_SIZE: usize = 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope exceeds maximum size.
    #[error("Envelope size {0} exceeds maximum {MAX_ENVELOPE_SIZE}")]
    TooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("Invalid envelope: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame bytes are not valid UTF-8.
    #[error("Envelope is not valid UTF-8")]
    InvalidUtf8,
}

/// Encode an envelope to a JSON string.
///
/// # Errors
///
/// Returns an error if the envelope is too large or serialization fails.
pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(envelope)?;
    if text.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::TooLarge(text.len()));
    }
    Ok(text)
}

/// Encode an envelope to bytes, for transports that want a byte payload.
///
/// # Errors
///
/// Returns an error if the envelope is too large or serialization fails.
pub fn encode_bytes(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    encode(envelope).map(Bytes::from)
}

/// Decode an envelope from a JSON string.
///
/// # Errors
///
/// Returns an error if the text is too large or not a valid envelope.
pub fn decode(text: &str) -> Result<Envelope, ProtocolError> {
    if text.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::TooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

/// Decode an envelope from raw frame bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not UTF-8 or not a valid envelope.
pub fn decode_bytes(data: &[u8]) -> Result<Envelope, ProtocolError> {
    let text = std::str::from_utf8(data).map_err(|_| ProtocolError::InvalidUtf8)?;
    decode(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeKind;
    use serde_json::json;

    #[test]
    fn test_encode_decode_roundtrip() {
        let envelopes = vec![
            Envelope::connect("conn-1", 30_000),
            Envelope::authenticate("token123", "alice"),
            Envelope::auth_success("alice", "sess-1"),
            Envelope::auth_failure("Invalid credential"),
            Envelope::room_message("lobby", json!({"text": "hello"})),
            Envelope::error("bad frame"),
            Envelope::ping(),
            Envelope::pong(),
        ];

        for envelope in envelopes {
            let encoded = encode(&envelope).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(envelope, decoded);
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode("not json"), Err(ProtocolError::Json(_))));
        assert!(matches!(
            decode(
                r#"{"id":"x","type":"launch_missiles","data":{},"timestamp":"2024-05-01T00:00:00Z"}"#
            ),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_decode_bytes_rejects_invalid_utf8() {
        let bad = [0xff, 0xfe, 0x00];
        assert!(matches!(decode_bytes(&bad), Err(ProtocolError::InvalidUtf8)));
    }

    #[test]
    fn test_envelope_too_large() {
        let payload = "x".repeat(MAX_ENVELOPE_SIZE + 1);
        let envelope = Envelope::new(EnvelopeKind::Message, json!({ "blob": payload }));
        assert!(matches!(encode(&envelope), Err(ProtocolError::TooLarge(_))));
    }

    #[test]
    fn test_missing_data_defaults_to_null() {
        let raw = r#"{"id":"f","type":"pong","timestamp":"2024-05-01T00:00:00Z"}"#;
        let env = decode(raw).unwrap();
        assert_eq!(env.kind, EnvelopeKind::Pong);
        assert!(env.data.is_null());
    }
}
