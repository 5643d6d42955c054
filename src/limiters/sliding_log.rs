//! Sliding window log
//!
//! Keeps the exact timestamp of every admitted call. A call is admitted when
//! fewer than `limit` timestamps fall inside the trailing `window`, so no
//! interval of length `window` ever holds more than `limit` admissions.
use std::collections::VecDeque;

use crate::clock::{self, SharedClock};
use crate::error::Result;
use crate::settings::WindowSettings;

use super::keyed_state::KeyedState;
use super::RateLimiter;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CallLog {
    /// Admission timestamps, oldest first
    pub calls: VecDeque<i64>,
}

impl CallLog {
    /// Drop timestamps that are `window_ms` or more in the past
    fn purge(&mut self, window_ms: i64, now: i64) {
        let cutoff = now - window_ms;
        while self.calls.front().is_some_and(|ts| *ts <= cutoff) {
            self.calls.pop_front();
        }
    }

    fn in_window(&self, window_ms: i64, now: i64) -> usize {
        let cutoff = now - window_ms;
        self.calls.iter().filter(|ts| **ts > cutoff).count()
    }

    fn last_call(&self) -> Option<i64> {
        self.calls.back().copied()
    }
}

#[derive(Debug)]
pub struct SlidingLogLimiter {
    settings: WindowSettings,
    clock: SharedClock,
    logs: KeyedState<CallLog>,
}

impl SlidingLogLimiter {
    pub fn new(settings: WindowSettings) -> Result<Self> {
        Self::with_clock(settings, clock::system_clock())
    }

    pub fn with_clock(settings: WindowSettings, clock: SharedClock) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            clock,
            logs: KeyedState::new(),
        })
    }

    pub fn get_settings(&self) -> &WindowSettings {
        &self.settings
    }

    /// Admission timestamps currently retained for `key`
    pub fn get_log(&self, key: &str) -> Vec<i64> {
        self.logs
            .peek(key, |log| log.calls.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl RateLimiter for SlidingLogLimiter {
    fn name(&self) -> &'static str {
        "sliding-log"
    }

    fn allow(&self, key: &str) -> bool {
        let now = self.clock.now_millis();
        let window_ms = self.settings.window_millis();
        let limit = self.settings.limit as usize;
        self.logs.with_state(key, CallLog::default, |log| {
            log.purge(window_ms, now);
            if log.calls.len() < limit {
                log.calls.push_back(now);
                true
            } else {
                false
            }
        })
    }

    fn calls_remaining(&self, key: &str) -> u32 {
        let now = self.clock.now_millis();
        let window_ms = self.settings.window_millis();
        let used = self
            .logs
            .peek(key, |log| log.in_window(window_ms, now))
            .unwrap_or(0);
        self.settings
            .limit
            .saturating_sub(u32::try_from(used).unwrap_or(u32::MAX))
    }

    fn reset(&self, key: &str) -> bool {
        self.logs.remove(key)
    }

    /// A log whose newest entry is two windows old is all stale
    fn expire_keys(&self) -> usize {
        let threshold = self.settings.window_millis().saturating_mul(2);
        let cutoff = self.clock.now_millis().saturating_sub(threshold);
        self.logs
            .sweep(|log| log.last_call().map_or(true, |last| last <= cutoff))
    }

    fn len(&self) -> usize {
        self.logs.len()
    }
}
