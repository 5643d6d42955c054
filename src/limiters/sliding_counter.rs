//! Sliding window counter
//!
//! Keeps two counts per key: the current window and the one before it. The
//! trailing-window count is estimated by weighting the previous window by
//! how much of it still overlaps the trailing window:
//!
//! ```text
//! estimate = previous * (1 - elapsed_in_current / window) + current
//! ```
//!
//! The estimate assumes calls were spread evenly across the previous window,
//! so it can be off in either direction when they were not. That is the
//! price of constant memory per key.
use crate::clock::{self, SharedClock};
use crate::error::Result;
use crate::settings::WindowSettings;

use super::keyed_state::KeyedState;
use super::RateLimiter;

#[derive(Clone, Debug, PartialEq)]
pub struct WindowCounts {
    pub current: u32,
    pub previous: u32,
    pub current_start: i64,
}

impl WindowCounts {
    pub fn new(now: i64) -> Self {
        Self {
            current: 0,
            previous: 0,
            current_start: now,
        }
    }

    /// Move the current window forward by whole windows until it covers `now`
    fn roll(&mut self, window_ms: i64, now: i64) {
        let elapsed = now - self.current_start;
        if elapsed < window_ms {
            return;
        }
        let windows_passed = elapsed / window_ms;
        self.previous = if windows_passed == 1 { self.current } else { 0 };
        self.current = 0;
        self.current_start += windows_passed * window_ms;
    }

    fn estimate(&self, window_ms: i64, now: i64) -> f64 {
        let elapsed = (now - self.current_start).clamp(0, window_ms);
        let overlap = 1.0 - elapsed as f64 / window_ms as f64;
        f64::from(self.previous) * overlap + f64::from(self.current)
    }
}

#[derive(Debug)]
pub struct SlidingCounterLimiter {
    settings: WindowSettings,
    clock: SharedClock,
    counters: KeyedState<WindowCounts>,
}

impl SlidingCounterLimiter {
    pub fn new(settings: WindowSettings) -> Result<Self> {
        Self::with_clock(settings, clock::system_clock())
    }

    pub fn with_clock(settings: WindowSettings, clock: SharedClock) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            clock,
            counters: KeyedState::new(),
        })
    }

    pub fn get_settings(&self) -> &WindowSettings {
        &self.settings
    }

    pub fn get_counts(&self, key: &str) -> Option<WindowCounts> {
        self.counters.peek(key, |counts| counts.clone())
    }

    /// Current trailing-window estimate for `key`
    pub fn estimate(&self, key: &str) -> f64 {
        let now = self.clock.now_millis();
        let window_ms = self.settings.window_millis();
        self.counters
            .peek(key, |counts| {
                let mut counts = counts.clone();
                counts.roll(window_ms, now);
                counts.estimate(window_ms, now)
            })
            .unwrap_or(0.0)
    }
}

impl RateLimiter for SlidingCounterLimiter {
    fn name(&self) -> &'static str {
        "sliding-counter"
    }

    fn allow(&self, key: &str) -> bool {
        let now = self.clock.now_millis();
        let window_ms = self.settings.window_millis();
        let limit = f64::from(self.settings.limit);
        self.counters.with_state(
            key,
            || WindowCounts::new(now),
            |counts| {
                counts.roll(window_ms, now);
                if counts.estimate(window_ms, now) + 1.0 <= limit {
                    counts.current = counts.current.saturating_add(1);
                    true
                } else {
                    false
                }
            },
        )
    }

    fn calls_remaining(&self, key: &str) -> u32 {
        let remaining = f64::from(self.settings.limit) - self.estimate(key);
        remaining.floor().clamp(0.0, f64::from(self.settings.limit)) as u32
    }

    fn reset(&self, key: &str) -> bool {
        self.counters.remove(key)
    }

    /// Two windows without a call means both counts would roll to zero
    fn expire_keys(&self) -> usize {
        let threshold = self.settings.window_millis().saturating_mul(2);
        let cutoff = self.clock.now_millis().saturating_sub(threshold);
        self.counters
            .sweep(|counts| counts.current_start <= cutoff)
    }

    fn len(&self) -> usize {
        self.counters.len()
    }
}
