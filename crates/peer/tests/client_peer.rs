//! The real client against the real peer, over loopback TCP.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use petri_debug_client::{
    CallbackQueue, ClientConfig, Collaborators, DebugClient, DebuggerHooks, LuaCompiler,
    LuaEvaluatorGenerator, NetDocument, PetriState, SessionState,
};
use petri_debug_peer::{DebugPeer, PeerConfig, StaticNet};
use petri_debug_protocol::PROTOCOL_VERSION;

const HASH: &str = "a9993e364706816aba3e25717850c26c9cd0d89d";

#[derive(Default)]
struct Hooks {
    errors: Mutex<Vec<String>>,
    results: Mutex<Vec<String>>,
}

impl DebuggerHooks for Hooks {
    fn on_error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }
    fn on_evaluation_result(&self, result: &str) {
        self.results.lock().unwrap().push(result.to_string());
    }
}

struct Document(&'static str);

impl NetDocument for Document {
    fn hash(&self) -> Result<String, String> {
        Ok(self.0.to_string())
    }
    fn rebuild(&self) -> Result<(), String> {
        Ok(())
    }
    fn contains_entity(&self, id: u64) -> bool {
        matches!(id, 7 | 12)
    }
}

struct Setup {
    peer: DebugPeer,
    host: Arc<StaticNet>,
    client: DebugClient,
    queue: Arc<CallbackQueue>,
    hooks: Arc<Hooks>,
    _dir: tempfile::TempDir,
}

fn setup(document_hash: &'static str) -> Setup {
    let host = Arc::new(
        StaticNet::new(HASH)
            .with_states([(7, 2)])
            .with_variable("tokens", 21),
    );
    let mut peer = DebugPeer::new();
    peer.start(
        PeerConfig { bind: "127.0.0.1:0".to_string(), ..PeerConfig::default() },
        host.clone(),
    )
    .unwrap();
    let addr = peer.bound_addr().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(CallbackQueue::new());
    let hooks = Arc::new(Hooks::default());
    let client = DebugClient::new(
        ClientConfig {
            address: addr.to_string(),
            connect_timeout: Duration::from_secs(2),
            eval_dir: dir.path().to_path_buf(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        },
        Collaborators {
            document: Arc::new(Document(document_hash)),
            codegen: Arc::new(LuaEvaluatorGenerator::new("Petri")),
            compiler: Arc::new(LuaCompiler),
            scheduler: queue.clone(),
            hooks: hooks.clone(),
        },
    );

    Setup { peer, host, client, queue, hooks, _dir: dir }
}

impl Setup {
    fn pump_until(&self, cond: impl Fn(&Setup) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            self.queue.run_pending();
            if cond(self) {
                return;
            }
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }
}

#[test]
fn test_full_session() {
    let s = setup(HASH);
    s.client.attach().unwrap();
    s.pump_until(|s| s.client.is_attached());

    s.client.add_breakpoint(12);
    s.client.start_petri();
    s.pump_until(|s| s.client.petri_state() == PetriState::Running);
    s.pump_until(|s| s.client.active_states().snapshot() == BTreeMap::from([(7, 2)]));
    s.pump_until(|s| s.host.breakpoints() == vec![12]);

    s.host.set_states([(12, 1)]);
    s.pump_until(|s| s.client.active_states().snapshot() == BTreeMap::from([(12, 1)]));

    s.client.evaluate("$tokens * 2", None).unwrap();
    s.pump_until(|s| !s.hooks.results.lock().unwrap().is_empty());
    assert_eq!(*s.hooks.results.lock().unwrap(), vec!["42"]);

    s.client.set_pause(true);
    s.pump_until(|s| s.client.petri_state() == PetriState::Paused);
    assert!(s.host.is_paused());

    s.client.stop_petri();
    s.pump_until(|s| s.client.petri_state() == PetriState::Stopped);
    assert!(!s.host.is_running());
    assert!(s.client.active_states().is_empty());

    assert!(s.hooks.errors.lock().unwrap().is_empty());
}

#[test]
fn test_hash_mismatch_reported() {
    let s = setup("0000000000000000000000000000000000000000");
    s.client.attach().unwrap();
    s.pump_until(|s| s.client.is_attached());

    s.client.start_petri();
    s.pump_until(|s| !s.hooks.errors.lock().unwrap().is_empty());
    assert_eq!(
        *s.hooks.errors.lock().unwrap(),
        vec!["The hash of the running petri net does not match"]
    );
    assert_eq!(s.client.petri_state(), PetriState::Stopped);
    assert!(s.client.is_attached());
}

#[test]
fn test_detach_then_reattach() {
    let s = setup(HASH);
    s.client.attach().unwrap();
    s.pump_until(|s| s.client.is_attached());
    s.client.start_petri();
    s.pump_until(|s| s.client.petri_state() == PetriState::Running);

    s.client.detach();
    assert_eq!(s.client.session_state(), SessionState::Detached);
    s.pump_until(|s| !s.peer.has_session());
    assert!(!s.host.is_running());

    s.client.attach().unwrap();
    s.pump_until(|s| s.client.is_attached());
    assert!(s.hooks.errors.lock().unwrap().is_empty());
}

#[test]
fn test_stop_session_shuts_peer_down() {
    let mut s = setup(HASH);
    s.client.attach().unwrap();
    s.pump_until(|s| s.client.is_attached());

    s.client.stop_session();
    s.pump_until(|s| !s.peer.is_running());
    s.peer.wait();
    s.queue.run_pending();
    assert!(s.hooks.errors.lock().unwrap().is_empty());
}

#[test]
fn test_stop_session_while_running_shuts_peer_down() {
    let mut s = setup(HASH);
    s.client.attach().unwrap();
    s.pump_until(|s| s.client.is_attached());
    s.client.start_petri();
    s.pump_until(|s| s.client.petri_state() == PetriState::Running);
    s.client.set_pause(true);
    s.pump_until(|s| s.client.petri_state() == PetriState::Paused);

    s.client.stop_session();
    assert_eq!(s.client.session_state(), SessionState::Detached);
    s.pump_until(|s| !s.peer.is_running());
    s.peer.wait();
    assert!(!s.host.is_running());
    s.queue.run_pending();
    assert!(s.hooks.errors.lock().unwrap().is_empty());
}
