//! Debug client session.
//!
//! [`DebugClient`] is driven from the control (UI) thread. Each attach spawns
//! one receiver thread (see `receiver.rs`) that owns the read side of the
//! channel. Both threads share a [`SessionCore`]; the control thread only
//! sends, the receiver thread reads and reports back through the callback
//! scheduler.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use petri_debug_config::DebuggerSettings;
use petri_debug_protocol::{FramedChannel, Message, PROTOCOL_VERSION};

use crate::bridge::{CallbackScheduler, DebuggerHooks, Notifier};
use crate::codegen::CodeGenerator;
use crate::compiler::CompilerInvoker;
use crate::document::NetDocument;
use crate::error::{DebugError, EvaluateError};
use crate::evaluate::{EvaluationRequest, Expression, LastEvaluations};
use crate::receiver;
use crate::registry::{ActiveStateMap, BreakpointSet};
use crate::state::{PetriState, SessionState, SessionStatus};

/// How long `attach` waits for the connection before returning.
pub const ATTACH_WAIT: Duration = Duration::from_secs(1);

/// Connection parameters.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the peer.
    pub address: String,
    pub connect_timeout: Duration,
    /// Where evaluation stubs and artifacts are written.
    pub eval_dir: PathBuf,
    pub protocol_version: String,
}

impl ClientConfig {
    pub fn from_settings(settings: &DebuggerSettings) -> Self {
        Self {
            address: settings.peer_address(),
            connect_timeout: settings.connect_timeout(),
            eval_dir: settings.evaluation_dir(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_settings(&DebuggerSettings::default())
    }
}

/// Everything the session needs from its embedder.
#[derive(Clone)]
pub struct Collaborators {
    pub document: Arc<dyn NetDocument>,
    pub codegen: Arc<dyn CodeGenerator>,
    pub compiler: Arc<dyn CompilerInvoker>,
    pub scheduler: Arc<dyn CallbackScheduler>,
    pub hooks: Arc<dyn DebuggerHooks>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by the control thread and the receiver thread.
pub(crate) struct SessionCore {
    pub(crate) config: ClientConfig,
    status: Mutex<SessionStatus>,
    channel: Mutex<Option<Arc<FramedChannel>>>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    /// Set while this side tears the connection down.
    closing: AtomicBool,
    pub(crate) breakpoints: BreakpointSet,
    pub(crate) active_states: ActiveStateMap,
    history: Mutex<LastEvaluations>,
    pub(crate) document: Arc<dyn NetDocument>,
    codegen: Arc<dyn CodeGenerator>,
    compiler: Arc<dyn CompilerInvoker>,
    pub(crate) notify: Notifier,
}

impl SessionCore {
    fn new(config: ClientConfig, collab: Collaborators) -> Self {
        Self {
            config,
            status: Mutex::new(SessionStatus::new()),
            channel: Mutex::new(None),
            receiver: Mutex::new(None),
            closing: AtomicBool::new(false),
            breakpoints: BreakpointSet::new(),
            active_states: ActiveStateMap::new(),
            history: Mutex::new(LastEvaluations::new()),
            document: collab.document,
            codegen: collab.codegen,
            compiler: collab.compiler,
            notify: Notifier::new(collab.scheduler, collab.hooks),
        }
    }

    pub(crate) fn status(&self) -> MutexGuard<'_, SessionStatus> {
        lock(&self.status)
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub(crate) fn install_channel(&self, channel: Arc<FramedChannel>) {
        *lock(&self.channel) = Some(channel);
    }

    /// Drop `channel` from the slot if it is still the current one.
    pub(crate) fn release_channel(&self, channel: &Arc<FramedChannel>) {
        let mut slot = lock(&self.channel);
        if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, channel)) {
            *slot = None;
        }
    }

    pub(crate) fn send(&self, msg: &Message) -> Result<(), DebugError> {
        let channel = lock(&self.channel).clone().ok_or(DebugError::NotConnected)?;
        channel.send_message(msg).map_err(DebugError::from)
    }

    pub(crate) fn send_all(&self, msgs: &[Message]) -> Result<(), DebugError> {
        msgs.iter().try_for_each(|m| self.send(m))
    }

    /// Report a send failure from the control thread: one error, detach,
    /// toolbar refresh.
    fn report(&self, result: Result<(), DebugError>) {
        if let Err(err) = result {
            self.fail(&err);
        }
    }

    pub(crate) fn fail(&self, err: &DebugError) {
        self.shutdown(false);
        self.notify.error(&err.to_string());
        self.notify.toolbar();
    }

    // -- Connection lifecycle ------------------------------------------------

    fn attach(self: &Arc<Self>) -> Result<(), DebugError> {
        {
            let mut receiver = lock(&self.receiver);
            if self.status().is_started() {
                return Ok(());
            }
            // A previous receiver may still be finishing its handshake
            let finished = receiver.as_ref().map(JoinHandle::is_finished);
            match finished {
                Some(false) => return Ok(()),
                Some(true) => {
                    if let Some(handle) = receiver.take() {
                        let _ = handle.join();
                    }
                }
                None => {}
            }
        }

        let addr = match resolve(&self.config.address) {
            Ok(addr) => addr,
            Err(err) => {
                self.notify.error(&err.to_string());
                self.notify.toolbar();
                return Err(err);
            }
        };

        self.closing.store(false, Ordering::SeqCst);
        let (connected_tx, connected_rx) = mpsc::channel();
        let core = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("petri-debug-receiver".to_string())
            .spawn(move || receiver::run(core, addr, connected_tx))
            .map_err(|e| DebugError::ConnectionFailed(e.to_string()))?;
        *lock(&self.receiver) = Some(handle);

        match connected_rx.recv_timeout(ATTACH_WAIT) {
            Ok(result) => result,
            // Still connecting; the receiver reports the outcome.
            Err(_) => Ok(()),
        }
    }

    /// Leave the session: farewell messages if started, close, join.
    pub(crate) fn shutdown(&self, end_session: bool) {
        // The peer may hang up as soon as it reads the farewell
        self.closing.store(true, Ordering::SeqCst);
        let farewell = self.status().detach_commands(end_session);
        if let Some(msgs) = farewell {
            log::info!("Detaching from debug peer");
            for msg in &msgs {
                if let Err(e) = self.send(msg) {
                    log::debug!("Could not send '{}' while detaching: {}", msg.kind(), e);
                    break;
                }
            }
        }

        self.active_states.clear();
        if let Some(channel) = lock(&self.channel).take() {
            channel.close();
        }
        self.join_receiver();
    }

    fn join_receiver(&self) {
        let handle = lock(&self.receiver).take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // Detaching from inside the receiver loop
                return;
            }
            if handle.join().is_err() {
                log::error!("Debug receiver thread panicked");
            }
        }
    }

    // -- Commands ------------------------------------------------------------

    pub(crate) fn start_petri(&self) {
        if !self.status().can_start() {
            return;
        }
        let hash = match self.document.hash() {
            Ok(hash) => hash,
            Err(e) => {
                self.notify.error(&e);
                return;
            }
        };
        let msg = self.status().start_command(&hash);
        if let Some(msg) = msg {
            self.report(self.send(&msg));
        }
    }

    /// Stop the net. Used by both threads; errors go to the caller.
    pub(crate) fn try_stop_petri(&self) -> Result<(), DebugError> {
        let msgs = self.status().stop_commands();
        self.send_all(&msgs)
    }

    pub(crate) fn stop_petri(&self) {
        self.report(self.try_stop_petri());
    }

    fn set_pause(&self, pause: bool) {
        let msg = self.status().pause_command(pause);
        if let Some(msg) = msg {
            self.report(self.send(&msg));
        }
    }

    fn reload_petri(&self) {
        self.notify.status("Reloading the petri net…");
        self.stop_petri();

        if let Err(diagnostics) = self.document.rebuild() {
            log::warn!("Net compilation failed: {}", diagnostics);
            let message = if diagnostics.is_empty() {
                "The compilation has failed.".to_string()
            } else {
                format!("The compilation has failed.\n{}", diagnostics)
            };
            self.notify.error(&message);
            return;
        }

        if self.status().is_started() {
            self.report(self.send(&Message::Reload));
        }
    }

    /// Push the breakpoint set while the net runs. Errors go to the caller.
    pub(crate) fn try_update_breakpoints(&self) -> Result<(), DebugError> {
        let active = {
            let status = self.status();
            status.is_started() && status.petri.is_active()
        };
        if !active {
            return Ok(());
        }
        self.send(&Message::Breakpoints(self.breakpoints.snapshot()))
    }

    fn evaluate(&self, text: &str, aux: Option<&str>) -> Result<(), EvaluateError> {
        lock(&self.history).record(text);
        if text.trim().is_empty() {
            return Err(EvaluateError::EmptyExpression);
        }

        let expression = Expression::parse(text);
        {
            let status = self.status();
            if expression.references_variables() && !status.petri.is_active() {
                return Err(EvaluateError::NetNotRunning);
            }
            if !status.is_started() {
                return Err(EvaluateError::NotAttached);
            }
        }

        let request =
            EvaluationRequest::prepare(expression, aux, &self.config.eval_dir, self.codegen.as_ref())?;
        let diagnostics = self.compiler.compile(&request.source_path, &request.artifact_path);
        if !diagnostics.is_empty() {
            log::debug!("Evaluator for '{}' does not compile", request.describe());
            request.discard();
            return Err(EvaluateError::Compilation(diagnostics));
        }

        let sent = self.send(&Message::evaluate(request.lib()));
        request.remove_source();
        if let Err(err) = sent {
            request.discard();
            let text = err.to_string();
            self.fail(&err);
            return Err(EvaluateError::Transport(text));
        }
        log::debug!("Sent evaluator {} for '{}'", request.lib(), request.describe());
        Ok(())
    }
}

/// Resolve `host:port` to the first address.
fn resolve(address: &str) -> Result<SocketAddr, DebugError> {
    address
        .to_socket_addrs()
        .map_err(|e| DebugError::ConnectionFailed(format!("{}: {}", address, e)))?
        .next()
        .ok_or_else(|| DebugError::ConnectionFailed(format!("{}: no address", address)))
}

/// Remote debugger for one net.
///
/// All methods take `&self`; commands that are not valid in the current
/// state do nothing. Dropping the client detaches.
pub struct DebugClient {
    core: Arc<SessionCore>,
}

impl DebugClient {
    pub fn new(config: ClientConfig, collaborators: Collaborators) -> Self {
        Self { core: Arc::new(SessionCore::new(config, collaborators)) }
    }

    /// Connect and start the handshake.
    ///
    /// Blocks until the socket is connected or [`ATTACH_WAIT`] elapsed. The
    /// handshake completes on the receiver thread; `session_state()` turns
    /// `Started` once `ehlo` arrived. A connect failure is returned here and
    /// also reported through `on_error`.
    pub fn attach(&self) -> Result<(), DebugError> {
        SessionCore::attach(&self.core)
    }

    /// Stop the net if needed, send `exit` and wait for the receiver thread.
    pub fn detach(&self) {
        let was_started = self.core.status().is_started();
        self.core.shutdown(false);
        if was_started {
            self.core.notify.status("Disconnected.");
        }
    }

    /// Like [`detach`](Self::detach) but ends the debugging session on the
    /// peer (`exitSession`).
    pub fn stop_session(&self) {
        let was_started = self.core.status().is_started();
        self.core.shutdown(true);
        if was_started {
            self.core.notify.status("Disconnected.");
        }
    }

    pub fn start_petri(&self) {
        self.core.start_petri();
    }

    pub fn stop_petri(&self) {
        self.core.stop_petri();
    }

    /// `true` pauses a running net, `false` resumes a paused one.
    pub fn set_pause(&self, pause: bool) {
        self.core.set_pause(pause);
    }

    /// Stop, rebuild the net through the document and send `reload`.
    pub fn reload_petri(&self) {
        self.core.reload_petri();
    }

    pub fn update_breakpoints(&self) {
        let result = self.core.try_update_breakpoints();
        self.core.report(result);
    }

    pub fn add_breakpoint(&self, id: u64) {
        if self.core.breakpoints.insert(id) {
            self.update_breakpoints();
        }
    }

    pub fn remove_breakpoint(&self, id: u64) {
        if self.core.breakpoints.remove(id) {
            self.update_breakpoints();
        }
    }

    /// Returns whether the breakpoint is set afterwards.
    pub fn toggle_breakpoint(&self, id: u64) -> bool {
        let set = self.core.breakpoints.toggle(id);
        self.update_breakpoints();
        set
    }

    /// Compile an evaluator for `expression` and ship it to the peer.
    ///
    /// The result arrives later through `on_evaluation_result`. `aux` is
    /// passed to the code generator (a printf format for C and C++).
    pub fn evaluate(&self, expression: &str, aux: Option<&str>) -> Result<(), EvaluateError> {
        self.core.evaluate(expression, aux)
    }

    pub fn session_state(&self) -> SessionState {
        self.core.status().session
    }

    pub fn petri_state(&self) -> PetriState {
        self.core.status().petri
    }

    pub fn status(&self) -> SessionStatus {
        self.core.status().clone()
    }

    pub fn is_attached(&self) -> bool {
        self.core.status().is_started()
    }

    /// Shared handle on the breakpoint set.
    pub fn breakpoints(&self) -> BreakpointSet {
        self.core.breakpoints.clone()
    }

    /// Shared handle on the active states, for the redraw path.
    pub fn active_states(&self) -> ActiveStateMap {
        self.core.active_states.clone()
    }

    /// Most recent first.
    pub fn last_evaluations(&self) -> Vec<String> {
        lock(&self.core.history).iter().map(str::to_string).collect()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.core.config
    }
}

impl Drop for DebugClient {
    fn drop(&mut self) {
        self.core.shutdown(false);
    }
}
