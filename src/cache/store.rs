//! Backing store collaborator
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;
use crate::store_error;

/// The slow, authoritative data source behind a cache
#[async_trait]
pub trait BackingStore<V>: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<V>>;

    async fn set(&self, key: &str, value: V) -> Result<()>;
}

/// In-process [`BackingStore`] with simulated latency, injected failures
/// and call counters
#[derive(Debug)]
pub struct InMemoryStore<V> {
    data: DashMap<String, V>,
    latency: Duration,
    failing_gets: AtomicBool,
    failing_sets: AtomicBool,
    // failures still to inject on `set`, ahead of `failing_sets`
    set_failures_left: AtomicU32,
    gets: AtomicUsize,
    sets: AtomicUsize,
}

impl<V> Default for InMemoryStore<V> {
    fn default() -> Self {
        Self {
            data: DashMap::new(),
            latency: Duration::ZERO,
            failing_gets: AtomicBool::new(false),
            failing_sets: AtomicBool::new(false),
            set_failures_left: AtomicU32::new(0),
            gets: AtomicUsize::new(0),
            sets: AtomicUsize::new(0),
        }
    }
}

impl<V: Clone> InMemoryStore<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `get` and `set` sleeps for `latency` first
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Seed a value without counting a `set`
    pub fn insert(&self, key: &str, value: V) {
        self.data.insert(key.to_string(), value);
    }

    /// Read a value without counting a `get`
    pub fn peek(&self, key: &str) -> Option<V> {
        self.data.get(key).map(|value| value.clone())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn set_failing_gets(&self, failing: bool) {
        self.failing_gets.store(failing, Ordering::SeqCst);
    }

    pub fn set_failing_sets(&self, failing: bool) {
        self.failing_sets.store(failing, Ordering::SeqCst);
    }

    /// Fail the next `count` calls to `set`
    pub fn fail_next_sets(&self, count: u32) {
        self.set_failures_left.store(count, Ordering::SeqCst);
    }

    /// Calls to `get`, failed ones included
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Calls to `set`, failed ones included
    pub fn sets(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn take_set_failure(&self) -> bool {
        let injected = self
            .set_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        injected || self.failing_sets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<V: Clone + Send + Sync> BackingStore<V> for InMemoryStore<V> {
    async fn get(&self, key: &str) -> Result<Option<V>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if self.failing_gets.load(Ordering::SeqCst) {
            return Err(store_error!("get {} failed", key));
        }
        Ok(self.peek(key))
    }

    async fn set(&self, key: &str, value: V) -> Result<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if self.take_set_failure() {
            return Err(store_error!("set {} failed", key));
        }
        self.data.insert(key.to_string(), value);
        Ok(())
    }
}
