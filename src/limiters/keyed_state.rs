//! Per-key limiter state with per-key locking
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

/// Map of key -> independently locked state.
///
/// The outer `DashMap` is sharded, so creating or removing one key only
/// write-locks its shard. Reads and updates of an existing key hold the shard
/// lock just long enough to clone the key's `Arc`; the state itself is then
/// guarded by its own mutex, so unrelated keys never wait on each other.
#[derive(Debug)]
pub struct KeyedState<S> {
    states: DashMap<String, Arc<Mutex<S>>>,
}

impl<S> Default for KeyedState<S> {
    fn default() -> Self {
        Self {
            states: DashMap::new(),
        }
    }
}

impl<S> KeyedState<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.states.contains_key(key)
    }

    fn existing(&self, key: &str) -> Option<Arc<Mutex<S>>> {
        self.states.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Run `f` on the state for `key`, creating it with `init` on first touch.
    ///
    /// Creation is double-checked: a read lookup first, then `entry` under
    /// the shard's write lock, so two racing first calls share one state.
    pub fn with_state<R>(
        &self,
        key: &str,
        init: impl FnOnce() -> S,
        f: impl FnOnce(&mut S) -> R,
    ) -> R {
        let state = match self.existing(key) {
            Some(state) => state,
            None => Arc::clone(
                self.states
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(init())))
                    .value(),
            ),
        };
        let mut guard = state.lock();
        f(&mut *guard)
    }

    /// Read the state for `key` without creating it
    pub fn peek<R>(&self, key: &str, f: impl FnOnce(&S) -> R) -> Option<R> {
        let state = self.existing(key)?;
        let guard = state.lock();
        Some(f(&*guard))
    }

    pub fn remove(&self, key: &str) -> bool {
        self.states.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.states.clear();
    }

    /// Visit every state under its own lock.
    ///
    /// Handles are collected first so no shard lock is held while a key's
    /// mutex is taken.
    pub fn for_each(&self, mut f: impl FnMut(&mut S)) {
        let handles: Vec<Arc<Mutex<S>>> = self
            .states
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for handle in handles {
            let mut guard = handle.lock();
            f(&mut *guard);
        }
    }

    /// Remove every state for which `is_idle` returns true. Returns the
    /// number of removed keys.
    ///
    /// A state whose `Arc` is currently cloned out by a caller is in use and
    /// is kept regardless; with the shard write-locked nobody can clone it
    /// in the meantime, so the lock taken here is uncontended.
    pub fn sweep(&self, mut is_idle: impl FnMut(&S) -> bool) -> usize {
        let before = self.states.len();
        self.states.retain(|_key, state| {
            if Arc::strong_count(state) > 1 {
                return true;
            }
            let guard = state.lock();
            !is_idle(&*guard)
        });
        before.saturating_sub(self.states.len())
    }
}
