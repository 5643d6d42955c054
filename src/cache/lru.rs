//! Least recently used cache
use std::num::NonZeroUsize;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::clock::{self, SharedClock};
use crate::config_error;
use crate::error::Result;

use super::{Cache, Entry};

/// Any `get` or `set` of a key makes it the most recently used; a `set` of
/// a new key at capacity evicts the least recently used one.
#[derive(Debug)]
pub struct LruCache<V> {
    entries: Mutex<lru::LruCache<String, Entry<V>>>,
    clock: SharedClock,
}

impl<V> LruCache<V> {
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_clock(capacity, clock::system_clock())
    }

    pub fn with_clock(capacity: usize, clock: SharedClock) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or_else(|| config_error!("cache capacity must be positive"))?;
        Ok(Self {
            entries: Mutex::new(lru::LruCache::new(capacity)),
            clock,
        })
    }
}

impl<V: Clone + Send + Sync> Cache<V> for LruCache<V> {
    fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            None => return None,
            Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
            Some(_) => {}
        }
        entries.pop(key);
        debug!("[lru] Purged expired key {}", key);
        None
    }

    fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        let entry = Entry::new(value, ttl, self.clock.now_millis());
        let replaced = self.entries.lock().push(key.to_string(), entry);
        if let Some((evicted, _)) = replaced {
            // push hands back the old entry when the key was already cached
            if evicted != key {
                debug!("[lru] Evicted {}", evicted);
            }
        }
    }

    fn delete(&self, key: &str) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    fn clear(&self) {
        self.entries.lock().clear();
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    /// Most to least recently used
    fn keys(&self) -> Vec<String> {
        self.entries.lock().iter().map(|(key, _)| key.clone()).collect()
    }
}
