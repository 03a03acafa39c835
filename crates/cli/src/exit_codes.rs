//! CLI Exit Code Registry
//!
//! Single source of truth for `petri-debug` exit codes. Scripts rely on them.
//!
//! | Code | Description                                        |
//! |------|----------------------------------------------------|
//! | 0    | Success                                            |
//! | 1    | General error (unspecified)                        |
//! | 2    | Usage error (bad args, missing or unreadable file) |
//! | 20   | Cannot connect to the debug peer                   |
//! | 21   | Protocol or session error                          |

use petri_debug_client::DebugError;

/// Success - command completed without errors.
pub const EXIT_SUCCESS: u8 = 0;

/// General error - unspecified failure.
pub const EXIT_ERROR: u8 = 1;

/// Usage error - bad arguments, missing input file.
pub const EXIT_USAGE: u8 = 2;

/// Cannot connect to the debug peer (nothing listening, refused, timeout).
pub const EXIT_SESSION_CONNECT: u8 = 20;

/// Protocol error (handshake refused, malformed message, session lost).
pub const EXIT_SESSION_PROTOCOL: u8 = 21;

/// Map a session error to its exit code.
pub fn debug_exit_code(err: &DebugError) -> u8 {
    match err {
        DebugError::ConnectionFailed(_) | DebugError::NotConnected => EXIT_SESSION_CONNECT,
        DebugError::UnexpectedDisconnect
        | DebugError::PeerUnavailable
        | DebugError::Transport(_)
        | DebugError::Protocol(_)
        | DebugError::Handshake(_)
        | DebugError::PeerTerminated(_)
        | DebugError::UnknownEntity(_) => EXIT_SESSION_PROTOCOL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_exit_codes() {
        assert_eq!(debug_exit_code(&DebugError::ConnectionFailed("x".into())), 20);
        assert_eq!(debug_exit_code(&DebugError::UnexpectedDisconnect), 21);
        assert_eq!(debug_exit_code(&DebugError::UnknownEntity(4)), 21);
    }
}
