//! zonesync protocol - peer replication wire format
//!
//! Peers exchange line-delimited frames. Every frame is a flat field map,
//! one `key: <json value>` line per field, terminated by a blank line:
//!
//! ```text
//! command: "pull_request"
//! position: 42
//!
//! ```
//!
//! The `command` field selects the message type; see [`Message`] for the
//! vocabulary and the fields each command carries.

#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod message;

pub use error::{ProtocolError, Result};
pub use frame::{Frame, FrameCodec, MAX_FRAME_SIZE};
pub use message::{ActionsStatus, AuthSchema, Message, WireEntry};
