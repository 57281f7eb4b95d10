//! JSON codec for channel frames.
//!
//! The wire format is one JSON object per WebSocket text frame. Decoding is
//! strict: missing fields, unknown kinds, and unknown topics all fail with
//! [`FrameError::Malformed`]. A malformed frame is never fatal to a
//! connection — session loops log it, drop it, and keep reading.

use thiserror::Error;

use crate::protocol::frame::Frame;

/// Error type for frame encoding and decoding.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The frame failed validation: bad JSON, an unrecognized kind or topic,
    /// or a missing required field.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Decodes one frame from the text of a WebSocket message.
///
/// # Errors
///
/// Returns [`FrameError::Malformed`] when the text is not a valid frame.
pub fn decode_frame(text: &str) -> Result<Frame, FrameError> {
    Ok(serde_json::from_str(text)?)
}

/// Encodes a frame to its wire text.
///
/// # Errors
///
/// Returns [`FrameError::Malformed`] if serialization fails; with the closed
/// kind and topic sets this only happens for payloads containing values JSON
/// cannot represent.
pub fn encode_frame(frame: &Frame) -> Result<String, FrameError> {
    Ok(serde_json::to_string(frame)?)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{MessageKind, RejectCode, Topic};
    use serde_json::{Map, Value};

    #[test]
    fn test_decode_command_frame_with_payload() {
        let text = r#"{"type":"command","topic":"control","payload":{"mode":"idle"}}"#;

        let frame = decode_frame(text).unwrap();

        assert_eq!(frame.kind, MessageKind::Command);
        assert_eq!(frame.topic, Topic::Control);
        let payload = frame.payload.expect("payload present in input");
        assert_eq!(payload.get("mode"), Some(&Value::String("idle".to_string())));
    }

    #[test]
    fn test_decode_signal_frame_without_payload() {
        let text = r#"{"type":"signal","topic":"boot"}"#;

        let frame = decode_frame(text).unwrap();

        assert_eq!(frame.kind, MessageKind::Signal);
        assert_eq!(frame.topic, Topic::Boot);
        assert!(frame.payload.is_none());
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let text = r#"{"type":"telemetry","topic":"status"}"#;
        assert!(matches!(
            decode_frame(text),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_topic() {
        let text = r#"{"type":"signal","topic":"gps"}"#;
        assert!(matches!(
            decode_frame(text),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_missing_topic() {
        let text = r#"{"type":"signal"}"#;
        assert!(decode_frame(text).is_err());
    }

    #[test]
    fn test_decode_rejects_missing_kind() {
        let text = r#"{"topic":"status","payload":{}}"#;
        assert!(decode_frame(text).is_err());
    }

    #[test]
    fn test_decode_rejects_invalid_json() {
        assert!(decode_frame("{{{ not json").is_err());
        assert!(decode_frame("").is_err());
    }

    #[test]
    fn test_encode_omits_absent_payload() {
        let frame = Frame::new(MessageKind::Peer, Topic::Status);

        let text = encode_frame(&frame).unwrap();

        assert_eq!(text, r#"{"type":"peer","topic":"status"}"#);
    }

    #[test]
    fn test_encode_decode_round_trip_with_payload() {
        let mut payload = Map::new();
        payload.insert("rpm".to_string(), Value::from(1450));
        payload.insert("temp".to_string(), Value::from(88.5));
        let original = Frame::with_payload(MessageKind::Signal, Topic::Engine, payload);

        let decoded = decode_frame(&encode_frame(&original).unwrap()).unwrap();

        assert_eq!(original, decoded);
    }

    #[test]
    fn test_rejection_frame_round_trips() {
        let original = Frame::rejection(Topic::Control, RejectCode::NotConnected, "gone");

        let decoded = decode_frame(&encode_frame(&original).unwrap()).unwrap();

        assert_eq!(decoded.kind, MessageKind::Error);
        let payload = decoded.payload.unwrap();
        assert_eq!(
            payload.get("code"),
            Some(&Value::String("not_connected".to_string()))
        );
    }
}
