//! Error types.
//!
//! `DebugError` covers everything that ends a session (transport and
//! protocol failures). `EvaluateError` is returned synchronously to the caller
//! of `evaluate` and never ends the session by itself.

use petri_debug_protocol::{ChannelError, FrameError};

/// Fatal session errors. `Display` is the text shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugError {
    /// Could not resolve or connect to the peer.
    ConnectionFailed(String),
    /// The peer closed the socket without an `exit` frame.
    UnexpectedDisconnect,
    /// Too many empty frames in a row.
    PeerUnavailable,
    /// Write failure or other socket error.
    Transport(String),
    /// Malformed frame or unexpected message.
    Protocol(String),
    /// Anything but `ehlo` in reply to `hello`.
    Handshake(String),
    /// `exit`/`exitSession` with a reason instead of the orderly sentinel.
    PeerTerminated(String),
    /// A `states` entry names an entity the document does not have.
    UnknownEntity(u64),
    NotConnected,
}

impl std::fmt::Display for DebugError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DebugError::ConnectionFailed(msg) => {
                write!(f, "Unable to connect to the debugger: {}", msg)
            }
            DebugError::UnexpectedDisconnect => write!(f, "Socket unexpectedly disconnected"),
            DebugError::PeerUnavailable => write!(f, "Remote debugger isn't available anymore!"),
            DebugError::Transport(msg) => write!(f, "Connection error: {}", msg),
            DebugError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            DebugError::Handshake(msg) => write!(f, "{}", msg),
            DebugError::PeerTerminated(reason) => write!(
                f,
                "Remote debugger requested a session termination for reason: {}",
                reason
            ),
            DebugError::UnknownEntity(id) => write!(
                f,
                "Entity sent from runtime doesn't exist on our side! (id: {})",
                id
            ),
            DebugError::NotConnected => write!(f, "Not connected to a debugger"),
        }
    }
}

impl std::error::Error for DebugError {}

impl From<FrameError> for DebugError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Closed => DebugError::UnexpectedDisconnect,
            FrameError::InvalidUtf8 | FrameError::TooLarge { .. } => {
                DebugError::Protocol(e.to_string())
            }
            FrameError::Io(e) => DebugError::Transport(e.to_string()),
        }
    }
}

impl From<ChannelError> for DebugError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Frame(e) => e.into(),
            ChannelError::Codec(e) => DebugError::Protocol(e.to_string()),
        }
    }
}

/// Errors returned by `evaluate`.
#[derive(Debug)]
pub enum EvaluateError {
    EmptyExpression,
    NotAttached,
    /// The expression reads a net variable but the net is stopped.
    NetNotRunning,
    /// The code generator could not render the stub.
    Render(String),
    /// Compiler diagnostics.
    Compilation(String),
    Io(std::io::Error),
    /// Sending `evaluate` failed; the session has been detached.
    Transport(String),
}

impl std::fmt::Display for EvaluateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvaluateError::EmptyExpression => write!(f, "Nothing to evaluate"),
            EvaluateError::NotAttached => write!(f, "The debugger is not attached"),
            EvaluateError::NetNotRunning => write!(
                f,
                "A variable of the petri net cannot be evaluated when the petri net is not running."
            ),
            EvaluateError::Render(msg) => write!(f, "Cannot generate the evaluator: {}", msg),
            EvaluateError::Compilation(diagnostics) => {
                write!(f, "Compilation error: {}", diagnostics)
            }
            EvaluateError::Io(e) => write!(f, "I/O error: {}", e),
            EvaluateError::Transport(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for EvaluateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EvaluateError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for EvaluateError {
    fn from(e: std::io::Error) -> Self {
        EvaluateError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_channel_is_unexpected_disconnect() {
        let err: DebugError = ChannelError::Frame(FrameError::Closed).into();
        assert_eq!(err, DebugError::UnexpectedDisconnect);
        assert_eq!(err.to_string(), "Socket unexpectedly disconnected");
    }

    #[test]
    fn test_user_facing_text() {
        assert_eq!(
            DebugError::UnknownEntity(42).to_string(),
            "Entity sent from runtime doesn't exist on our side! (id: 42)"
        );
        assert_eq!(
            DebugError::PeerTerminated("crash".into()).to_string(),
            "Remote debugger requested a session termination for reason: crash"
        );
        assert_eq!(
            EvaluateError::Compilation("x.c:1: error".into()).to_string(),
            "Compilation error: x.c:1: error"
        );
    }
}
