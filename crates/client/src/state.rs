//! Session state machine.
//!
//! Two independent dimensions: whether a session is attached, and what the
//! remote net is doing. Commands never change the net state themselves. They
//! yield the messages to send, and the state only moves when the matching
//! `ack` arrives.

use petri_debug_protocol::{AckKind, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Detached,
    Started,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PetriState {
    #[default]
    Stopped,
    Running,
    Paused,
}

impl PetriState {
    /// Running or paused: the net exists on the peer and holds variables.
    pub fn is_active(&self) -> bool {
        !matches!(self, PetriState::Stopped)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatus {
    pub session: SessionState,
    pub petri: PetriState,
    /// Version announced in the handshake that produced `Started`.
    pub protocol_version: Option<String>,
    /// Pause or resume sent and not yet acknowledged.
    pause_requested: Option<bool>,
}

impl SessionStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.session == SessionState::Started
    }

    /// `ehlo` received.
    pub fn on_handshake(&mut self, version: &str) {
        self.session = SessionState::Started;
        self.petri = PetriState::Stopped;
        self.protocol_version = Some(version.to_string());
        self.pause_requested = None;
    }

    /// Orderly `exit` from the peer. Returns whether a session was started.
    pub fn on_orderly_exit(&mut self) -> bool {
        let was_started = self.is_started();
        self.reset();
        was_started
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn can_start(&self) -> bool {
        self.is_started() && !self.petri.is_active()
    }

    /// `start{hash}` if the net can be started.
    pub fn start_command(&self, hash: &str) -> Option<Message> {
        self.can_start().then(|| Message::start(hash))
    }

    /// Messages that stop the net: `resume` first when paused.
    pub fn stop_commands(&mut self) -> Vec<Message> {
        if !self.is_started() {
            return Vec::new();
        }
        match self.petri {
            PetriState::Stopped => Vec::new(),
            PetriState::Running => vec![Message::Stop],
            PetriState::Paused => {
                self.pause_requested = Some(false);
                vec![Message::Resume, Message::Stop]
            }
        }
    }

    /// `pause` or `resume`, unless the net is already there or on its way.
    pub fn pause_command(&mut self, pause: bool) -> Option<Message> {
        if !self.is_started() || self.pause_requested == Some(pause) {
            return None;
        }
        match (pause, self.petri) {
            (true, PetriState::Running) => {
                self.pause_requested = Some(true);
                Some(Message::Pause)
            }
            (false, PetriState::Paused) => {
                self.pause_requested = Some(false);
                Some(Message::Resume)
            }
            _ => None,
        }
    }

    /// Leave the session. Returns the farewell messages, or `None` when no
    /// session is started. The status is `Detached` afterwards either way.
    pub fn detach_commands(&mut self, end_session: bool) -> Option<Vec<Message>> {
        if !self.is_started() {
            self.reset();
            return None;
        }
        let mut msgs = self.stop_commands();
        msgs.push(if end_session { Message::ExitSession(None) } else { Message::Exit(None) });
        self.reset();
        Some(msgs)
    }

    /// Apply an acknowledgment. Returns whether the state changed.
    pub fn apply_ack(&mut self, ack: AckKind) -> bool {
        if !self.is_started() {
            return false;
        }
        let next = match (ack, self.petri) {
            (AckKind::Start, _) => PetriState::Running,
            (AckKind::Stop, _) => PetriState::Stopped,
            (AckKind::Pause, PetriState::Running) => PetriState::Paused,
            (AckKind::Resume, PetriState::Paused) => PetriState::Running,
            (AckKind::Pause | AckKind::Resume | AckKind::Reload, current) => current,
        };
        if matches!(ack, AckKind::Pause | AckKind::Resume | AckKind::Stop | AckKind::Start) {
            self.pause_requested = None;
        }
        let changed = next != self.petri;
        if changed {
            log::debug!("Petri state {:?} -> {:?} (ack {})", self.petri, next, ack.as_str());
        }
        self.petri = next;
        changed
    }
}
