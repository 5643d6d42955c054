//! Leaky bucket rate limiting algorithm
//!
//! Each key owns an admission queue of at most `capacity` entries. Callers
//! are admitted while the queue has room; a background task leaks one entry
//! per key every `1 / leak_per_second` seconds, independent of callers.
use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::clock::{self, SharedClock};
use crate::error::Result;
use crate::settings::LeakyBucketSettings;
use crate::task::{PeriodicJob, PeriodicTask};

use super::keyed_state::KeyedState;
use super::RateLimiter;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LeakyBucket {
    /// Admission timestamps, oldest first
    pub queue: VecDeque<i64>,
    pub last_leak: i64,
    pub last_call: i64,
}

impl LeakyBucket {
    pub fn new(now: i64) -> Self {
        Self {
            queue: VecDeque::new(),
            last_leak: now,
            last_call: now,
        }
    }

    fn try_admit(&mut self, capacity: u32, now: i64) -> bool {
        self.last_call = now;
        if self.queue.len() < capacity as usize {
            self.queue.push_back(now);
            true
        } else {
            false
        }
    }

    /// Drop the oldest admission, if any
    pub fn leak(&mut self, now: i64) -> Option<i64> {
        self.last_leak = now;
        self.queue.pop_front()
    }
}

struct LeakJob {
    buckets: Arc<KeyedState<LeakyBucket>>,
    clock: SharedClock,
}

#[async_trait]
impl PeriodicJob for LeakJob {
    async fn tick(&mut self) {
        let now = self.clock.now_millis();
        let mut leaked = 0usize;
        self.buckets.for_each(|bucket| {
            if bucket.leak(now).is_some() {
                leaked += 1;
            }
        });
        if leaked > 0 {
            debug!("[leaky-bucket] Leaked {} entries", leaked);
        }
    }
}

/// Leaky bucket limiter. Owns the background leak task; call
/// [`LeakyBucketLimiter::stop`] before dropping it.
#[derive(Debug)]
pub struct LeakyBucketLimiter {
    settings: LeakyBucketSettings,
    clock: SharedClock,
    buckets: Arc<KeyedState<LeakyBucket>>,
    leak_task: Mutex<Option<PeriodicTask>>,
}

impl LeakyBucketLimiter {
    /// Must be called from within a tokio runtime: the leak task starts here.
    pub fn new(settings: LeakyBucketSettings) -> Result<Self> {
        Self::with_clock(settings, clock::system_clock())
    }

    pub fn with_clock(settings: LeakyBucketSettings, clock: SharedClock) -> Result<Self> {
        settings.validate()?;
        let buckets = Arc::new(KeyedState::new());
        let job = LeakJob {
            buckets: buckets.clone(),
            clock: clock.clone(),
        };
        let leak_task = PeriodicTask::spawn("leaky-bucket", settings.leak_interval(), job)?;
        Ok(Self {
            settings,
            clock,
            buckets,
            leak_task: Mutex::new(Some(leak_task)),
        })
    }

    pub fn get_settings(&self) -> &LeakyBucketSettings {
        &self.settings
    }

    /// Number of queued admissions for `key`
    pub fn queued(&self, key: &str) -> usize {
        self.buckets.peek(key, |bucket| bucket.queue.len()).unwrap_or(0)
    }

    pub fn is_leaking(&self) -> bool {
        self.leak_task
            .lock()
            .as_ref()
            .map(|task| task.is_running())
            .unwrap_or(false)
    }

    /// Stop the leak task and wait for it. Queues stop draining afterwards.
    pub async fn stop(&self) -> Result<()> {
        let task = self.leak_task.lock().take();
        match task {
            Some(mut task) => task.stop().await,
            None => Ok(()),
        }
    }
}

impl RateLimiter for LeakyBucketLimiter {
    fn name(&self) -> &'static str {
        "leaky-bucket"
    }

    fn allow(&self, key: &str) -> bool {
        let now = self.clock.now_millis();
        let capacity = self.settings.capacity;
        self.buckets.with_state(
            key,
            || LeakyBucket::new(now),
            |bucket| bucket.try_admit(capacity, now),
        )
    }

    fn calls_remaining(&self, key: &str) -> u32 {
        let queued = self.queued(key);
        let queued = u32::try_from(queued).unwrap_or(u32::MAX);
        self.settings.capacity.saturating_sub(queued)
    }

    fn reset(&self, key: &str) -> bool {
        self.buckets.remove(key)
    }

    /// Empty queues idle for twice the full drain time are dropped
    fn expire_keys(&self) -> usize {
        let threshold = clock::duration_millis(self.settings.full_drain()).saturating_mul(2);
        let cutoff = self.clock.now_millis().saturating_sub(threshold);
        self.buckets
            .sweep(|bucket| bucket.queue.is_empty() && bucket.last_call <= cutoff)
    }

    fn len(&self) -> usize {
        self.buckets.len()
    }
}
