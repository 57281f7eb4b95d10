//! Channel frame types.
//!
//! A [`Frame`] is one message exchanged over a machine or operator socket.
//! Frames are data only: they carry no behavior beyond validation, and they
//! are immutable once constructed — the hub routes them, it never edits them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Fleet-unique identifier of a remote machine instance.
pub type InstanceId = Uuid;

/// Identifier of one operator socket session.
///
/// A fresh session id is minted for every accepted operator socket; claims
/// are recorded against it so exclusivity survives reconnects correctly.
pub type SessionId = Uuid;

// ── Message kind ──────────────────────────────────────────────────────────────

/// The closed set of message kinds.
///
/// Serialized lowercase on the wire (`"command"`, `"signal"`, ...). Any other
/// value fails frame validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Directs an instance to act; subject to claim gating.
    Command,
    /// Originates from an instance describing its own state.
    Signal,
    /// Passed through between sessions without claim gating.
    Peer,
    /// Error notification, including typed rejections from the hub.
    Error,
}

// ── Topic ─────────────────────────────────────────────────────────────────────

/// The closed set of sub-channel topics.
///
/// Topics are validated at the frame boundary: a frame naming an unknown
/// topic is malformed and is rejected before it reaches the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    /// Operator control directives (mode changes, stop, resume).
    Control,
    /// Engine state and engine commands.
    Engine,
    /// Motion commands.
    Motion,
    /// Boot announcement from an instance.
    Boot,
    /// Periodic status reports from an instance.
    Status,
    /// Fault reports from an instance.
    Error,
    /// Host/telemetry reports eligible for persistence.
    Vms,
}

impl Topic {
    /// Whether commands on this topic are forwarded to a machine.
    ///
    /// Only `control`, `engine`, and `motion` are recognized command
    /// sub-channels; commands on any other topic are dropped by the
    /// operator session loop.
    pub fn is_command_topic(self) -> bool {
        matches!(self, Topic::Control | Topic::Engine | Topic::Motion)
    }
}

// ── Rejection codes ───────────────────────────────────────────────────────────

/// Machine-readable cause carried in a rejection frame.
///
/// Operators must be able to distinguish "try again later" from "that
/// instance is gone", so rejections are typed rather than free-form text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectCode {
    /// The target instance has no live connection.
    NotConnected,
    /// Another session holds the command claim on the instance.
    ClaimConflict,
    /// The instance's send queue failed; its connection was torn down.
    PeerSendFailure,
    /// The instance this session was attached to disconnected.
    InstanceDisconnected,
}

impl RejectCode {
    /// Wire representation used in the rejection payload's `code` field.
    pub fn as_str(self) -> &'static str {
        match self {
            RejectCode::NotConnected => "not_connected",
            RejectCode::ClaimConflict => "claim_conflict",
            RejectCode::PeerSendFailure => "peer_send_failure",
            RejectCode::InstanceDisconnected => "instance_disconnected",
        }
    }
}

// ── Frame ─────────────────────────────────────────────────────────────────────

/// One message exchanged over a channel socket.
///
/// # Wire shape
///
/// ```json
/// { "type": "signal", "topic": "boot", "payload": { "uptime": 0 } }
/// ```
///
/// `kind` and `topic` are always present; `payload` may be absent and is
/// omitted from the encoded form when `None`. The payload's shape is
/// topic-dependent and is not validated by the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Message kind; serialized as the `type` field.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Sub-channel this frame belongs to.
    pub topic: Topic,
    /// Opaque topic-dependent content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
}

impl Frame {
    /// Creates a frame without a payload.
    pub fn new(kind: MessageKind, topic: Topic) -> Self {
        Self {
            kind,
            topic,
            payload: None,
        }
    }

    /// Creates a frame carrying a payload object.
    pub fn with_payload(kind: MessageKind, topic: Topic, payload: Map<String, Value>) -> Self {
        Self {
            kind,
            topic,
            payload: Some(payload),
        }
    }

    /// Builds a typed rejection frame for an operator.
    ///
    /// The frame is `error`-kind with a payload of the form
    /// `{ "code": "claim_conflict", "detail": "..." }`. The topic echoes the
    /// sub-channel of the rejected request so the operator can correlate.
    pub fn rejection(topic: Topic, code: RejectCode, detail: impl Into<String>) -> Self {
        let mut payload = Map::new();
        payload.insert("code".to_string(), Value::String(code.as_str().to_string()));
        payload.insert("detail".to_string(), Value::String(detail.into()));
        Self::with_payload(MessageKind::Error, topic, payload)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
