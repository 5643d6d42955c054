//! Fixed window limiter backed by a shared counter store
//!
//! Several processes limiting the same keys share their counts through an
//! external [`CounterStore`]. Windows are aligned to multiples of the window
//! length, so every process agrees on the window a call falls into, and each
//! window's counter is a separate store key that expires on its own.
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock::{self, SharedClock};
use crate::error::{Result, WrenError};
use crate::settings::WindowSettings;
use crate::{config_error, store_error};

/// External atomic counter service
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add one to `key`, creating it at zero first. Returns the new count.
    async fn increment(&self, key: &str) -> Result<u64>;

    /// Delete `key` once `ttl` has passed
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
}

/// What to answer when the counter store fails
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreFailurePolicy {
    /// Return the store error to the caller
    #[default]
    Propagate,
    /// Deny the call
    FailClosed,
    /// Admit the call without counting it
    FailOpen,
}

impl fmt::Display for StoreFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreFailurePolicy::Propagate => "propagate",
            StoreFailurePolicy::FailClosed => "fail-closed",
            StoreFailurePolicy::FailOpen => "fail-open",
        };
        f.write_str(name)
    }
}

impl FromStr for StoreFailurePolicy {
    type Err = WrenError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "propagate" => Ok(StoreFailurePolicy::Propagate),
            "fail-closed" => Ok(StoreFailurePolicy::FailClosed),
            "fail-open" => Ok(StoreFailurePolicy::FailOpen),
            other => Err(config_error!("unknown store failure policy '{}'", other)),
        }
    }
}

pub struct DistributedWindowLimiter {
    settings: WindowSettings,
    store: Arc<dyn CounterStore>,
    clock: SharedClock,
    policy: StoreFailurePolicy,
    // counter key -> window index, for counters whose expire call failed
    unexpired: Mutex<HashMap<String, i64>>,
}

impl fmt::Debug for DistributedWindowLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedWindowLimiter")
            .field("settings", &self.settings)
            .field("policy", &self.policy)
            .finish()
    }
}

impl DistributedWindowLimiter {
    pub fn new(settings: WindowSettings, store: Arc<dyn CounterStore>) -> Result<Self> {
        Self::with_clock(settings, store, clock::system_clock())
    }

    pub fn with_clock(
        settings: WindowSettings,
        store: Arc<dyn CounterStore>,
        clock: SharedClock,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            store,
            clock,
            policy: StoreFailurePolicy::default(),
            unexpired: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_failure_policy(mut self, policy: StoreFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn failure_policy(&self) -> StoreFailurePolicy {
        self.policy
    }

    fn window_index(&self, now: i64) -> i64 {
        now.div_euclid(self.settings.window_millis())
    }

    /// Store key of the window that `now` falls into
    pub fn counter_key(&self, key: &str, now: i64) -> String {
        format!("{}:{}", key, self.window_index(now))
    }

    /// Admit or deny one call for `key`.
    ///
    /// Store failures are handled according to the failure policy; only
    /// `Propagate` returns them. The window's first call sets the counter's
    /// expiry; if that fails, later calls in the same window set it again
    /// until the store accepts it.
    pub async fn allow(&self, key: &str) -> Result<bool> {
        match self.count_call(key).await {
            Ok(count) => Ok(count <= u64::from(self.settings.limit)),
            Err(err) => self.on_store_error(key, err),
        }
    }

    async fn count_call(&self, key: &str) -> Result<u64> {
        let window_index = self.window_index(self.clock.now_millis());
        let counter_key = format!("{}:{}", key, window_index);
        let count = self.store.increment(&counter_key).await?;
        let needs_expiry = count == 1 || self.unexpired.lock().contains_key(&counter_key);
        if needs_expiry {
            match self.store.expire(&counter_key, self.settings.window).await {
                Ok(()) => {
                    self.unexpired.lock().remove(&counter_key);
                }
                Err(err) => {
                    warn!("[{}] Could not set counter expiry: {}", counter_key, err);
                    let mut unexpired = self.unexpired.lock();
                    // earlier windows' keys are never incremented again
                    unexpired.retain(|_, index| *index >= window_index);
                    unexpired.insert(counter_key, window_index);
                    return Err(err);
                }
            }
        }
        Ok(count)
    }

    fn on_store_error(&self, key: &str, err: WrenError) -> Result<bool> {
        match self.policy {
            StoreFailurePolicy::Propagate => Err(err),
            StoreFailurePolicy::FailClosed => {
                warn!("[{}] Counter store failed, denying: {}", key, err);
                Ok(false)
            }
            StoreFailurePolicy::FailOpen => {
                warn!("[{}] Counter store failed, allowing: {}", key, err);
                Ok(true)
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Counter {
    count: u64,
    expires_at: Option<i64>,
}

impl Counter {
    fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process [`CounterStore`] with optional failure injection
#[derive(Debug)]
pub struct MemoryCounterStore {
    counters: DashMap<String, Counter>,
    clock: SharedClock,
    failing: AtomicBool,
    failing_expire: AtomicBool,
    increments: AtomicU64,
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::with_clock(clock::system_clock())
    }
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            counters: DashMap::new(),
            clock,
            failing: AtomicBool::new(false),
            failing_expire: AtomicBool::new(false),
            increments: AtomicU64::new(0),
        }
    }

    /// Make every following call fail until switched off again
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make only `expire` fail until switched off again
    pub fn set_failing_expire(&self, failing: bool) {
        self.failing_expire.store(failing, Ordering::SeqCst);
    }

    /// Counters held, expired ones not yet pruned included
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// When `key` expires, if an expiry has been set
    pub fn expires_at(&self, key: &str) -> Option<i64> {
        self.counters.get(key).and_then(|counter| counter.expires_at)
    }

    /// Successful increments so far
    pub fn increments(&self) -> u64 {
        self.increments.load(Ordering::SeqCst)
    }

    /// Current value of `key`, treating expired counters as absent
    pub fn get(&self, key: &str) -> Option<u64> {
        let now = self.clock.now_millis();
        self.counters
            .get(key)
            .filter(|counter| !counter.is_expired(now))
            .map(|counter| counter.count)
    }

    fn check_failing(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(store_error!("counter store unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str) -> Result<u64> {
        self.check_failing()?;
        let now = self.clock.now_millis();
        // A new key means a new window; drop counters whose windows are over.
        // Must run before `entry`, which holds a shard lock.
        if !self.counters.contains_key(key) {
            self.counters.retain(|_, counter| !counter.is_expired(now));
        }
        let mut counter = self.counters.entry(key.to_string()).or_insert(Counter {
            count: 0,
            expires_at: None,
        });
        if counter.is_expired(now) {
            counter.count = 0;
            counter.expires_at = None;
        }
        counter.count += 1;
        self.increments.fetch_add(1, Ordering::SeqCst);
        Ok(counter.count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.check_failing()?;
        if self.failing_expire.load(Ordering::SeqCst) {
            return Err(store_error!("expire {} failed", key));
        }
        let expires_at = self
            .clock
            .now_millis()
            .saturating_add(clock::duration_millis(ttl));
        if let Some(mut counter) = self.counters.get_mut(key) {
            counter.expires_at = Some(expires_at);
        }
        Ok(())
    }
}
