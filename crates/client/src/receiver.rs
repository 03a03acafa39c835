//! Receiver loop: one thread per session, owner of the channel's read side.
//!
//! The loop connects, performs the handshake, then decodes and dispatches
//! every inbound message until the session leaves `Started`. Any error ends
//! the session: implicit detach first, then one error notification, then a
//! toolbar refresh. When this side is the one closing the connection, the
//! resulting read error is expected and not reported.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use petri_debug_protocol::{AckKind, FramedChannel, Message, StateEntry};

use crate::document::NetDocument;
use crate::error::DebugError;
use crate::evaluate::remove_quietly;
use crate::session::SessionCore;

/// Empty frames tolerated in a row before the peer is considered gone.
pub const RECEIVE_RETRIES: u32 = 5;
/// Pause between two polls of an empty channel.
pub const RETRY_SPACING: Duration = Duration::from_millis(1);

pub(crate) fn run(
    core: Arc<SessionCore>,
    addr: SocketAddr,
    connected: mpsc::Sender<Result<(), DebugError>>,
) {
    let channel = match FramedChannel::connect(&addr, core.config.connect_timeout) {
        Ok(channel) => Arc::new(channel),
        Err(e) => {
            let err = DebugError::ConnectionFailed(format!("{}: {}", addr, e));
            core.notify.error(&err.to_string());
            core.notify.toolbar();
            let _ = connected.send(Err(err));
            return;
        }
    };
    log::info!("Connected to debug peer at {}", addr);
    core.install_channel(Arc::clone(&channel));
    let _ = connected.send(Ok(()));

    let outcome = handshake(&core, &channel).and_then(|()| message_loop(&core, &channel));
    match outcome {
        Err(err) if core.is_closing() => {
            log::debug!("Receiver stopped while detaching: {}", err);
        }
        Err(err) => {
            log::warn!("Debug session failed: {}", err);
            core.shutdown(false);
            core.notify.error(&err.to_string());
        }
        Ok(()) => log::debug!("Receiver loop finished"),
    }

    channel.close();
    core.release_channel(&channel);
    core.notify.toolbar();
}

/// Receive one message, polling up to [`RECEIVE_RETRIES`] more times while
/// the channel yields empty frames.
pub(crate) fn receive_with_retry(channel: &FramedChannel) -> Result<Message, DebugError> {
    let mut retries = 0;
    loop {
        if let Some(msg) = channel.receive_message()? {
            return Ok(msg);
        }
        if retries == RECEIVE_RETRIES {
            return Err(DebugError::PeerUnavailable);
        }
        retries += 1;
        thread::sleep(RETRY_SPACING);
    }
}

fn handshake(core: &SessionCore, channel: &FramedChannel) -> Result<(), DebugError> {
    if core.is_closing() {
        return Ok(());
    }
    let version = core.config.protocol_version.as_str();
    channel.send_message(&Message::hello(version))?;

    match receive_with_retry(channel)? {
        Message::Ehlo => {
            core.status().on_handshake(version);
            log::info!("Debug session started (protocol {})", version);
            core.notify.status("Successfully connected.");
            core.notify.toolbar();
            Ok(())
        }
        Message::Error(reason) => Err(DebugError::Handshake(format!(
            "An error was returned by the debugger: {}",
            reason
        ))),
        other => {
            log::debug!("Expected ehlo, got '{}'", other.kind());
            Err(DebugError::Handshake(
                "Invalid message received from debugger (expected ehlo)".to_string(),
            ))
        }
    }
}

fn message_loop(core: &SessionCore, channel: &FramedChannel) -> Result<(), DebugError> {
    while core.status().is_started() {
        let msg = receive_with_retry(channel)?;
        dispatch(core, msg)?;
    }
    Ok(())
}

fn dispatch(core: &SessionCore, msg: Message) -> Result<(), DebugError> {
    log::debug!("Received '{}' from debug peer", msg.kind());
    let orderly = msg.is_orderly_exit();
    match msg {
        Message::Ack(ack) => on_ack(core, ack),
        Message::Error(text) => {
            core.notify.error(&text);
            if core.status().petri.is_active() {
                core.try_stop_petri()?;
            }
            Ok(())
        }
        Message::Exit(_) | Message::ExitSession(_) if orderly => {
            if core.status().on_orderly_exit() {
                core.active_states.clear();
                core.notify.status("Disconnected.");
            }
            Ok(())
        }
        Message::Exit(reason) | Message::ExitSession(reason) => {
            Err(DebugError::PeerTerminated(reason.unwrap_or_default()))
        }
        Message::States(entries) => {
            let states = resolve_states(&entries, core.document.as_ref())?;
            core.active_states.replace(states);
            core.notify.states_updated();
            Ok(())
        }
        Message::Evaluation(result) => {
            if !result.lib.is_empty() {
                remove_quietly(std::path::Path::new(&result.lib));
            }
            core.notify.evaluation(result.eval);
            Ok(())
        }
        other => Err(DebugError::Protocol(format!(
            "Unexpected '{}' message from debugger",
            other.kind()
        ))),
    }
}

fn on_ack(core: &SessionCore, ack: AckKind) -> Result<(), DebugError> {
    let changed = core.status().apply_ack(ack);
    match ack {
        AckKind::Start => {
            if changed {
                core.try_update_breakpoints()?;
            }
            core.notify.status("The petri net is running.");
        }
        AckKind::Stop => {
            core.active_states.clear();
            core.notify.states_updated();
            core.notify.status("The petri net execution has ended.");
        }
        AckKind::Pause => core.notify.status("Paused."),
        AckKind::Resume => core.notify.status("The petri net is running."),
        AckKind::Reload => core.notify.status("The Petri net has been successfully reloaded."),
    }
    core.notify.toolbar();
    Ok(())
}

/// Build the new active-state map, rejecting ids the document does not know.
fn resolve_states(
    entries: &[StateEntry],
    document: &dyn NetDocument,
) -> Result<BTreeMap<u64, u64>, DebugError> {
    entries
        .iter()
        .map(|entry| {
            if document.contains_entity(entry.id) {
                Ok((entry.id, entry.count))
            } else {
                Err(DebugError::UnknownEntity(entry.id))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};

    struct Known(Vec<u64>);

    impl NetDocument for Known {
        fn hash(&self) -> Result<String, String> {
            Ok(String::new())
        }
        fn rebuild(&self) -> Result<(), String> {
            Ok(())
        }
        fn contains_entity(&self, id: u64) -> bool {
            self.0.contains(&id)
        }
    }

    fn frames(texts: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        for text in texts {
            out.extend_from_slice(&(text.len() as u32).to_le_bytes());
            out.extend_from_slice(text.as_bytes());
        }
        out
    }

    #[test]
    fn test_retry_skips_empty_frames() {
        let input = frames(&["", "", r#"{"type":"ehlo"}"#]);
        let channel = FramedChannel::new(Cursor::new(input), io::sink());
        assert_eq!(receive_with_retry(&channel).unwrap(), Message::Ehlo);
    }

    #[test]
    fn test_retry_gives_up_after_five() {
        let input = frames(&["", "", "", "", "", "", r#"{"type":"ehlo"}"#]);
        let channel = FramedChannel::new(Cursor::new(input), io::sink());
        assert_eq!(receive_with_retry(&channel).unwrap_err(), DebugError::PeerUnavailable);
    }

    #[test]
    fn test_retry_malformed_is_protocol_error() {
        let channel = FramedChannel::new(Cursor::new(frames(&["{oops"])), io::sink());
        assert!(matches!(receive_with_retry(&channel), Err(DebugError::Protocol(_))));
    }

    #[test]
    fn test_resolve_states() {
        let doc = Known(vec![7, 8]);
        let map = resolve_states(
            &[StateEntry { id: 7, count: 2 }, StateEntry { id: 8, count: 0 }],
            &doc,
        )
        .unwrap();
        assert_eq!(map, BTreeMap::from([(7, 2), (8, 0)]));

        let err = resolve_states(&[StateEntry { id: 9, count: 1 }], &doc).unwrap_err();
        assert_eq!(err, DebugError::UnknownEntity(9));
    }
}
