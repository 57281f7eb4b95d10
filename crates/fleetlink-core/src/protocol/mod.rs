//! Channel wire protocol: frame types and the JSON codec.

pub mod codec;
pub mod frame;

pub use codec::{decode_frame, encode_frame, FrameError};
pub use frame::{Frame, InstanceId, MessageKind, RejectCode, SessionId, Topic};
