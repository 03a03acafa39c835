//! The net a peer debugs.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Process-side control over a running net.
///
/// Called from the session thread only; implementations synchronize with
/// the net's own threads.
pub trait NetHost: Send + Sync {
    /// SHA-1 hex digest of the source the loaded net was generated from.
    fn hash(&self) -> String;

    fn start(&self) -> Result<(), String>;

    fn stop(&self);

    fn set_pause(&self, pause: bool);

    /// Reload the net library from disk.
    fn reload(&self) -> Result<(), String>;

    /// Replace the breakpoint set.
    fn set_breakpoints(&self, ids: &[u64]);

    /// Entity id to token count, for every state holding tokens.
    fn active_states(&self) -> BTreeMap<u64, u64>;

    /// Net variables visible to evaluators.
    fn variables(&self) -> BTreeMap<String, i64>;
}

#[derive(Debug, Default)]
struct Net {
    running: bool,
    paused: bool,
    breakpoints: Vec<u64>,
    states: BTreeMap<u64, u64>,
    variables: BTreeMap<String, i64>,
    reloads: u32,
}

/// A net with fixed active states, reported while it runs.
///
/// Stands in for a real net in `petri-debug serve` and in tests.
#[derive(Debug)]
pub struct StaticNet {
    hash: String,
    net: Mutex<Net>,
}

impl StaticNet {
    pub fn new(hash: impl Into<String>) -> Self {
        Self { hash: hash.into(), net: Mutex::new(Net::default()) }
    }

    pub fn with_states(self, states: impl IntoIterator<Item = (u64, u64)>) -> Self {
        self.lock().states = states.into_iter().collect();
        self
    }

    pub fn with_variable(self, name: &str, value: i64) -> Self {
        self.lock().variables.insert(name.to_string(), value);
        self
    }

    /// Change the reported states, as if the net had advanced.
    pub fn set_states(&self, states: impl IntoIterator<Item = (u64, u64)>) {
        self.lock().states = states.into_iter().collect();
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub fn breakpoints(&self) -> Vec<u64> {
        self.lock().breakpoints.clone()
    }

    pub fn reloads(&self) -> u32 {
        self.lock().reloads
    }

    fn lock(&self) -> MutexGuard<'_, Net> {
        self.net.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl NetHost for StaticNet {
    fn hash(&self) -> String {
        self.hash.clone()
    }

    fn start(&self) -> Result<(), String> {
        let mut net = self.lock();
        net.running = true;
        net.paused = false;
        Ok(())
    }

    fn stop(&self) {
        let mut net = self.lock();
        net.running = false;
        net.paused = false;
    }

    fn set_pause(&self, pause: bool) {
        let mut net = self.lock();
        if net.running {
            net.paused = pause;
        }
    }

    fn reload(&self) -> Result<(), String> {
        self.lock().reloads += 1;
        Ok(())
    }

    fn set_breakpoints(&self, ids: &[u64]) {
        self.lock().breakpoints = ids.to_vec();
    }

    fn active_states(&self) -> BTreeMap<u64, u64> {
        let net = self.lock();
        if net.running {
            net.states.clone()
        } else {
            BTreeMap::new()
        }
    }

    fn variables(&self) -> BTreeMap<String, i64> {
        self.lock().variables.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_states_only_while_running() {
        let net = StaticNet::new("abc").with_states([(7, 2)]);
        assert!(net.active_states().is_empty());
        net.start().unwrap();
        assert_eq!(net.active_states(), BTreeMap::from([(7, 2)]));
        net.stop();
        assert!(net.active_states().is_empty());
    }

    #[test]
    fn test_pause_requires_running() {
        let net = StaticNet::new("abc");
        net.set_pause(true);
        assert!(!net.is_paused());
        net.start().unwrap();
        net.set_pause(true);
        assert!(net.is_paused());
        net.stop();
        assert!(!net.is_paused());
    }
}
