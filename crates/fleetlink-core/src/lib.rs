//! # fleetlink-core
//!
//! Shared library for Fleetlink containing the channel wire protocol: the
//! frame type exchanged over machine and operator sockets, its validation
//! rules, and the JSON codec.
//!
//! This crate is used by the hub service and is intended to be shared with
//! future machine-agent and operator-client crates. It has zero dependencies
//! on sockets, async runtimes, or OS APIs.
//!
//! # Protocol overview
//!
//! Every WebSocket text frame carries one JSON object:
//!
//! ```json
//! { "type": "command", "topic": "control", "payload": { "mode": "idle" } }
//! ```
//!
//! - **`type`** is the message kind: `command`, `signal`, `peer`, or `error`.
//!   The set is closed; unrecognized kinds fail validation, they are never
//!   silently coerced.
//! - **`topic`** names the sub-channel (`control`, `engine`, `motion`, `boot`,
//!   `status`, `error`, `vms`). Also a closed set, validated at the frame
//!   boundary so an unknown topic fails fast instead of being dropped deep
//!   inside the router.
//! - **`payload`** is an optional opaque object whose shape depends on the
//!   topic. The hub routes it without inspecting it.

pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `fleetlink_core::Frame` instead of `fleetlink_core::protocol::frame::Frame`.
pub use protocol::codec::{decode_frame, encode_frame, FrameError};
pub use protocol::frame::{Frame, InstanceId, MessageKind, RejectCode, SessionId, Topic};
