//! Breakpoints and active states shared between the control thread and the
//! receiver thread.
//!
//! Both are cheap `Arc` handles; clones share the same content.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Entities the peer should halt at.
#[derive(Debug, Clone, Default)]
pub struct BreakpointSet {
    inner: Arc<Mutex<BTreeSet<u64>>>,
}

impl BreakpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the breakpoint was not set before.
    pub fn insert(&self, id: u64) -> bool {
        lock(&self.inner).insert(id)
    }

    /// Returns true if the breakpoint was set.
    pub fn remove(&self, id: u64) -> bool {
        lock(&self.inner).remove(&id)
    }

    /// Flip a breakpoint. Returns whether it is set afterwards.
    pub fn toggle(&self, id: u64) -> bool {
        let mut set = lock(&self.inner);
        if set.remove(&id) {
            false
        } else {
            set.insert(id);
            true
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        lock(&self.inner).contains(&id)
    }

    /// Sorted copy, as sent in a `breakpoints` message.
    pub fn snapshot(&self) -> Vec<u64> {
        lock(&self.inner).iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).is_empty()
    }

    pub fn clear(&self) {
        lock(&self.inner).clear();
    }
}

/// Token count per active state, as last reported by the peer.
///
/// Replaced wholesale: readers see either the previous report or the new
/// one, never a mix.
#[derive(Debug, Clone, Default)]
pub struct ActiveStateMap {
    inner: Arc<Mutex<BTreeMap<u64, u64>>>,
}

impl ActiveStateMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, states: BTreeMap<u64, u64>) {
        *lock(&self.inner) = states;
    }

    pub fn clear(&self) {
        lock(&self.inner).clear();
    }

    pub fn token_count(&self, id: u64) -> Option<u64> {
        lock(&self.inner).get(&id).copied()
    }

    pub fn is_active(&self, id: u64) -> bool {
        lock(&self.inner).contains_key(&id)
    }

    pub fn snapshot(&self) -> BTreeMap<u64, u64> {
        lock(&self.inner).clone()
    }

    /// Run `f` against the current map while holding the lock.
    pub fn with<R>(&self, f: impl FnOnce(&BTreeMap<u64, u64>) -> R) -> R {
        f(&lock(&self.inner))
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn test_breakpoint_toggle() {
        let set = BreakpointSet::new();
        assert!(set.toggle(5));
        assert!(set.contains(5));
        assert!(!set.toggle(5));
        assert!(set.is_empty());
    }

    #[test]
    fn test_breakpoint_snapshot_sorted() {
        let set = BreakpointSet::new();
        for id in [9, 1, 4, 1] {
            set.insert(id);
        }
        assert_eq!(set.snapshot(), vec![1, 4, 9]);
        assert!(set.remove(4));
        assert!(!set.remove(4));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_clones_share_state() {
        let map = ActiveStateMap::new();
        let other = map.clone();
        map.replace(BTreeMap::from([(7, 2)]));
        assert_eq!(other.token_count(7), Some(2));
        other.clear();
        assert!(map.is_empty());
    }

    #[test]
    fn test_replace_is_atomic_for_readers() {
        let old: BTreeMap<u64, u64> = (0..200).map(|id| (id, 1)).collect();
        let new: BTreeMap<u64, u64> = (1000..1100).map(|id| (id, 3)).collect();

        let map = ActiveStateMap::new();
        map.replace(old.clone());
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let map = map.clone();
            let done = Arc::clone(&done);
            let (old, new) = (old.clone(), new.clone());
            thread::spawn(move || {
                for i in 0..2000 {
                    map.replace(if i % 2 == 0 { new.clone() } else { old.clone() });
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        while !done.load(Ordering::SeqCst) {
            let seen = map.snapshot();
            assert!(seen == old || seen == new, "observed a partial map of {} entries", seen.len());
        }
        writer.join().unwrap();
    }
}
