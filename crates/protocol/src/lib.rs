//! Petri Net Debugger Protocol
//!
//! This crate defines the wire protocol spoken between the editor (the debug
//! client) and a running Petri net (the debug peer). Both roles share these
//! types so the message set cannot drift between them.
//!
//! # Wire format
//!
//! Every message is one frame: a `u32` little-endian byte count followed by
//! that many bytes of UTF-8 JSON. The JSON is an object with a string `type`
//! and an optional `payload`:
//!
//! ```text
//! {"type":"hello","payload":{"version":"0.2"}}
//! {"type":"ehlo"}
//! {"type":"states","payload":[{"id":"7","count":2}]}
//! ```
//!
//! There is no request id. Replies are matched by type and ordering.
//!
//! # Usage
//!
//! ```ignore
//! use petri_debug_protocol::{FramedChannel, Message, PROTOCOL_VERSION};
//!
//! let channel = FramedChannel::connect(&addr, timeout)?;
//! channel.send_message(&Message::hello(PROTOCOL_VERSION))?;
//! let reply = channel.receive_message()?;
//! ```

pub mod frame;
pub mod message;

pub use frame::{FrameError, FramedChannel, MAX_FRAME_BYTES};
pub use message::{
    AckKind, CodecError, EvaluatePayload, EvaluationPayload, HelloPayload, Message, StartPayload,
    StateEntry, EXIT_SENTINEL,
};

/// Protocol version announced in `hello`. The peer refuses any other value.
pub const PROTOCOL_VERSION: &str = "0.2";

/// Errors surfaced by [`FramedChannel::receive_message`] and friends.
#[derive(Debug)]
pub enum ChannelError {
    Frame(FrameError),
    Codec(CodecError),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::Frame(e) => write!(f, "{}", e),
            ChannelError::Codec(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::Frame(e) => Some(e),
            ChannelError::Codec(e) => Some(e),
        }
    }
}

impl From<FrameError> for ChannelError {
    fn from(e: FrameError) -> Self {
        ChannelError::Frame(e)
    }
}

impl From<CodecError> for ChannelError {
    fn from(e: CodecError) -> Self {
        ChannelError::Codec(e)
    }
}

impl ChannelError {
    /// True when the peer closed the connection (as opposed to a broken frame).
    pub fn is_closed(&self) -> bool {
        matches!(self, ChannelError::Frame(FrameError::Closed))
    }
}
