//! TCP debug server for a running net.
//!
//! One listener thread accepts connections; the first one becomes the
//! debugging session and gets its own thread, later ones are refused while it
//! lasts. The session thread reads with a short timeout so it can poll the
//! host's active states between messages.

use std::collections::BTreeMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use petri_debug_protocol::{
    AckKind, ChannelError, FrameError, FramedChannel, Message, StateEntry, PROTOCOL_VERSION,
};

use crate::dylib::proxy_for;
use crate::host::NetHost;

/// Sent to a connection arriving while a session is open.
pub const SESSION_ACTIVE_MESSAGE: &str = "A debugging session is already active";

const HASH_MISMATCH_MESSAGE: &str = "The hash of the running petri net does not match";

/// Peer configuration.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// `host:port` to listen on. Port 0 picks a free port.
    pub bind: String,
    /// Evaluator entry points are named `<prefix>_evaluate`.
    pub prefix: String,
    /// Interval between two polls of the host's active states.
    pub poll_interval: Duration,
    pub protocol_version: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:12345".to_string(),
            prefix: "Petri".to_string(),
            poll_interval: Duration::from_millis(50),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }
}

impl PeerConfig {
    fn evaluator_symbol(&self) -> String {
        format!("{}_evaluate", self.prefix)
    }
}

/// The debug server: listener thread plus at most one session.
pub struct DebugPeer {
    listener_handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    session_active: Arc<AtomicBool>,
    bound_addr: Option<SocketAddr>,
}

impl DebugPeer {
    /// Create a peer (not started).
    pub fn new() -> Self {
        Self {
            listener_handle: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            session_active: Arc::new(AtomicBool::new(false)),
            bound_addr: None,
        }
    }

    /// Bind and start accepting sessions for `host`.
    pub fn start(&mut self, config: PeerConfig, host: Arc<dyn NetHost>) -> io::Result<()> {
        if self.is_running() {
            return Ok(());
        }
        self.join();
        self.shutdown.store(false, Ordering::SeqCst);

        let listener = TcpListener::bind(config.bind.as_str())?;
        let addr = listener.local_addr()?;
        self.bound_addr = Some(addr);

        // Non-blocking so the loop sees the shutdown flag
        listener.set_nonblocking(true)?;

        let shutdown = Arc::clone(&self.shutdown);
        let session_active = Arc::clone(&self.session_active);
        self.listener_handle = Some(
            thread::Builder::new()
                .name("petri-debug-listener".to_string())
                .spawn(move || run_listener(listener, shutdown, session_active, config, host))?,
        );

        log::info!("Debug peer listening on {}", addr);
        Ok(())
    }

    /// Stop listening and end the current session.
    pub fn stop(&mut self) {
        if self.listener_handle.is_none() {
            return;
        }
        self.shutdown.store(true, Ordering::SeqCst);
        self.join();
        log::info!("Debug peer stopped");
    }

    /// Block until the peer shuts down, which a session does with `exitSession`.
    pub fn wait(&mut self) {
        self.join();
    }

    fn join(&mut self) {
        if let Some(handle) = self.listener_handle.take() {
            if handle.join().is_err() {
                log::error!("Debug peer listener panicked");
            }
        }
        self.bound_addr = None;
    }

    pub fn is_running(&self) -> bool {
        self.listener_handle.is_some() && !self.shutdown.load(Ordering::SeqCst)
    }

    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.bound_addr
    }

    pub fn has_session(&self) -> bool {
        self.session_active.load(Ordering::SeqCst)
    }
}

impl Default for DebugPeer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DebugPeer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_listener(
    listener: TcpListener,
    shutdown: Arc<AtomicBool>,
    session_active: Arc<AtomicBool>,
    config: PeerConfig,
    host: Arc<dyn NetHost>,
) {
    let mut session: Option<JoinHandle<()>> = None;

    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                if session_active.load(Ordering::SeqCst) {
                    log::warn!("Connection refused from {}: session already active", addr);
                    refuse(stream);
                    continue;
                }

                if let Some(previous) = session.take() {
                    let _ = previous.join();
                }
                log::info!("Debug session opened from {}", addr);
                session_active.store(true, Ordering::SeqCst);

                let shutdown = Arc::clone(&shutdown);
                let active = Arc::clone(&session_active);
                let config = config.clone();
                let host = Arc::clone(&host);
                let spawned = thread::Builder::new()
                    .name("petri-debug-session".to_string())
                    .spawn(move || {
                        let result = handle_connection(stream, &config, host.as_ref(), &shutdown);
                        if let Err(e) = result {
                            log::warn!("Debug session with {} failed: {}", addr, e);
                        }
                        log::info!("Debug session with {} closed", addr);
                        active.store(false, Ordering::SeqCst);
                    });
                match spawned {
                    Ok(handle) => session = Some(handle),
                    Err(e) => {
                        log::error!("Cannot start debug session thread: {}", e);
                        session_active.store(false, Ordering::SeqCst);
                    }
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                log::error!("Accept error: {}", e);
                break;
            }
        }
    }

    if let Some(handle) = session {
        let _ = handle.join();
    }
}

fn refuse(stream: TcpStream) {
    let _ = stream.set_nonblocking(false);
    match FramedChannel::from_stream(stream) {
        Ok(channel) => {
            let _ = channel.send_message(&Message::error(SESSION_ACTIVE_MESSAGE));
            channel.close();
        }
        Err(e) => log::debug!("Cannot answer refused connection: {}", e),
    }
}

/// What to do with the connection after a message.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// One debugging session.
struct Session<'a> {
    channel: FramedChannel,
    config: &'a PeerConfig,
    host: &'a dyn NetHost,
    shutdown: &'a AtomicBool,
    greeted: bool,
    running: bool,
    /// A write to the client failed; frames it sent before leaving are
    /// still read and handled.
    client_gone: bool,
    last_states: Option<BTreeMap<u64, u64>>,
    last_poll: Option<Instant>,
}

fn handle_connection(
    stream: TcpStream,
    config: &PeerConfig,
    host: &dyn NetHost,
    shutdown: &AtomicBool,
) -> Result<(), ChannelError> {
    stream.set_nonblocking(false).map_err(FrameError::from)?;
    let channel = FramedChannel::from_stream(stream).map_err(FrameError::from)?;
    channel.set_read_timeout(Some(config.poll_interval)).map_err(FrameError::from)?;

    let mut session = Session {
        channel,
        config,
        host,
        shutdown,
        greeted: false,
        running: false,
        client_gone: false,
        last_states: None,
        last_poll: None,
    };
    let result = session.run();

    if session.running {
        log::info!("Stopping the net left running by the session");
        host.stop();
    }
    session.channel.close();
    result
}

impl Session<'_> {
    fn run(&mut self) -> Result<(), ChannelError> {
        while !self.shutdown.load(Ordering::SeqCst) {
            self.poll_states();

            let msg = match self.channel.receive_message() {
                Ok(Some(msg)) => msg,
                Ok(None) if self.client_gone => {
                    log::info!("Debug client stopped reading");
                    return Ok(());
                }
                Ok(None) => continue,
                Err(e) if e.is_closed() => {
                    log::info!("Debug client disconnected");
                    return Ok(());
                }
                Err(ChannelError::Codec(e)) => {
                    log::debug!("Malformed message from client: {}", e);
                    self.send(Message::error(format!("Malformed message: {}", e)));
                    continue;
                }
                Err(e) => return Err(e),
            };

            log::debug!("Received '{}' from debug client", msg.kind());
            if self.handle(msg) == Flow::Close {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Send to the client. After the first failure nothing more is written.
    fn send(&mut self, msg: Message) {
        if self.client_gone {
            return;
        }
        if let Err(e) = self.channel.send_message(&msg) {
            log::debug!("Cannot send '{}' to the debug client: {}", msg.kind(), e);
            self.client_gone = true;
        }
    }

    fn ack(&mut self, kind: AckKind) {
        self.send(Message::Ack(kind));
    }

    fn handle(&mut self, msg: Message) -> Flow {
        if !self.greeted {
            return self.greet(msg);
        }

        match msg {
            Message::Start(payload) => {
                if payload.hash != self.host.hash() {
                    log::warn!("Start refused: hash {} does not match", payload.hash);
                    self.send(Message::error(HASH_MISMATCH_MESSAGE));
                    return Flow::Continue;
                }
                match self.host.start() {
                    Ok(()) => {
                        self.running = true;
                        self.last_states = None;
                        self.last_poll = None;
                        self.ack(AckKind::Start);
                    }
                    Err(e) => self.send(Message::error(e)),
                }
            }
            Message::Stop => {
                self.host.stop();
                self.running = false;
                self.last_states = None;
                self.ack(AckKind::Stop);
            }
            Message::Pause => {
                self.host.set_pause(true);
                self.ack(AckKind::Pause);
            }
            Message::Resume => {
                self.host.set_pause(false);
                self.ack(AckKind::Resume);
            }
            Message::Reload => match self.host.reload() {
                Ok(()) => self.ack(AckKind::Reload),
                Err(e) => self.send(Message::error(e)),
            },
            Message::Breakpoints(ids) => {
                log::debug!("{} breakpoint(s) set", ids.len());
                self.host.set_breakpoints(&ids);
            }
            Message::Evaluate(payload) => {
                let eval = self.evaluate(&payload.lib);
                self.send(Message::evaluation(payload.lib, eval));
            }
            Message::Exit(_) => {
                self.send(Message::goodbye());
                return Flow::Close;
            }
            Message::ExitSession(_) => {
                log::info!("Debug session ended by the client");
                // Set before replying, the client may have closed already
                self.shutdown.store(true, Ordering::SeqCst);
                self.send(Message::goodbye());
                return Flow::Close;
            }
            other => {
                self.send(Message::error(format!(
                    "Unexpected '{}' message",
                    other.kind()
                )));
            }
        }
        Flow::Continue
    }

    fn greet(&mut self, msg: Message) -> Flow {
        match msg {
            Message::Hello(hello) if hello.version == self.config.protocol_version => {
                self.greeted = true;
                self.send(Message::Ehlo);
                Flow::Continue
            }
            Message::Hello(hello) => {
                log::warn!("Client speaks protocol {}", hello.version);
                self.send(Message::error(format!(
                    "Unsupported debugger protocol version {} (expected {})",
                    hello.version, self.config.protocol_version
                )));
                Flow::Close
            }
            other => {
                self.send(Message::error(format!(
                    "Expected hello, got '{}'",
                    other.kind()
                )));
                Flow::Close
            }
        }
    }

    /// Send `states` when the running net's active states changed.
    fn poll_states(&mut self) {
        if !self.running || self.client_gone {
            return;
        }
        if let Some(last) = self.last_poll {
            if last.elapsed() < self.config.poll_interval {
                return;
            }
        }
        self.last_poll = Some(Instant::now());

        let states = self.host.active_states();
        if self.last_states.as_ref() == Some(&states) {
            return;
        }
        let entries = states
            .iter()
            .map(|(&id, &count)| StateEntry { id, count })
            .collect();
        self.send(Message::States(entries));
        self.last_states = Some(states);
    }

    /// Load, run and unload an evaluator. Failures become the result text.
    fn evaluate(&self, lib: &str) -> String {
        let path = Path::new(lib);
        let mut proxy = match proxy_for(path) {
            Ok(proxy) => proxy,
            Err(reason) => return reason,
        };

        let symbol = self.config.evaluator_symbol();
        let result = match proxy.load(path, &symbol) {
            Ok(true) => proxy.evaluate(&self.host.variables()).unwrap_or_else(|e| e.to_string()),
            Ok(false) => proxy
                .last_error()
                .map(str::to_string)
                .unwrap_or_else(|| format!("Cannot load {}", lib)),
            Err(e) => e.to_string(),
        };
        proxy.unload();
        result
    }
}
