//! Least frequently used cache
//!
//! Every entry counts its reads. Entries are also indexed by
//! `(frequency, last_touch)` in a `BTreeMap`, so the eviction victim is
//! always the first key of the index: the lowest frequency, and among equal
//! frequencies the entry touched longest ago.
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::clock::{self, SharedClock};
use crate::config_error;
use crate::error::Result;

use super::{Cache, Entry};

#[derive(Debug)]
struct Slot<V> {
    entry: Entry<V>,
    frequency: u64,
    touched: u64,
}

#[derive(Debug)]
struct LfuState<V> {
    slots: HashMap<String, Slot<V>>,
    // (frequency, touched) -> key
    order: BTreeMap<(u64, u64), String>,
    tick: u64,
}

impl<V> LfuState<V> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, key: &str) -> Option<Slot<V>> {
        let slot = self.slots.remove(key)?;
        self.order.remove(&(slot.frequency, slot.touched));
        Some(slot)
    }

    fn evict_one(&mut self) -> Option<String> {
        let (_, key) = self.order.pop_first()?;
        self.slots.remove(&key);
        Some(key)
    }
}

#[derive(Debug)]
pub struct LfuCache<V> {
    state: Mutex<LfuState<V>>,
    capacity: usize,
    clock: SharedClock,
}

impl<V> LfuCache<V> {
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_clock(capacity, clock::system_clock())
    }

    pub fn with_clock(capacity: usize, clock: SharedClock) -> Result<Self> {
        if capacity == 0 {
            return Err(config_error!("cache capacity must be positive"));
        }
        Ok(Self {
            state: Mutex::new(LfuState {
                slots: HashMap::with_capacity(capacity),
                order: BTreeMap::new(),
                tick: 0,
            }),
            capacity,
            clock,
        })
    }

    /// Read count of `key`, without counting this call
    pub fn frequency(&self, key: &str) -> Option<u64> {
        self.state.lock().slots.get(key).map(|slot| slot.frequency)
    }
}

impl<V: Clone + Send + Sync> Cache<V> for LfuCache<V> {
    fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now_millis();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let tick = state.next_tick();
        let slot = state.slots.get_mut(key)?;
        if slot.entry.is_expired(now) {
            state.remove(key);
            debug!("[lfu] Purged expired key {}", key);
            return None;
        }
        let old = (slot.frequency, slot.touched);
        slot.frequency = slot.frequency.saturating_add(1);
        slot.touched = tick;
        let new = (slot.frequency, slot.touched);
        let value = slot.entry.value.clone();
        state.order.remove(&old);
        state.order.insert(new, key.to_string());
        Some(value)
    }

    /// Overwriting keeps the key's frequency
    fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        let entry = Entry::new(value, ttl, self.clock.now_millis());
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let tick = state.next_tick();
        let frequency = match state.remove(key) {
            Some(previous) => previous.frequency,
            None => {
                if state.slots.len() >= self.capacity {
                    if let Some(evicted) = state.evict_one() {
                        debug!("[lfu] Evicted {}", evicted);
                    }
                }
                0
            }
        };
        state.order.insert((frequency, tick), key.to_string());
        state.slots.insert(
            key.to_string(),
            Slot {
                entry,
                frequency,
                touched: tick,
            },
        );
    }

    fn delete(&self, key: &str) -> bool {
        self.state.lock().remove(key).is_some()
    }

    fn clear(&self) {
        let mut state = self.state.lock();
        state.slots.clear();
        state.order.clear();
    }

    fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn keys(&self) -> Vec<String> {
        self.state.lock().slots.keys().cloned().collect()
    }
}
