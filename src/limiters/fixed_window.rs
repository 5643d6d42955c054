//! Fixed window counter
//!
//! A window opens at a key's first call and counts calls until `window` has
//! elapsed; the first call after that opens a new window at its own time.
//! Calls clustered on both sides of a reset can add up to twice the limit
//! within one window length.
use crate::clock::{self, SharedClock};
use crate::error::Result;
use crate::settings::WindowSettings;

use super::keyed_state::KeyedState;
use super::RateLimiter;

#[derive(Clone, Debug, PartialEq)]
pub struct FixedWindow {
    pub count: u32,
    pub window_start: i64,
}

impl FixedWindow {
    pub fn new(now: i64) -> Self {
        Self {
            count: 0,
            window_start: now,
        }
    }

    fn roll(&mut self, window_ms: i64, now: i64) {
        if now - self.window_start >= window_ms {
            self.count = 0;
            self.window_start = now;
        }
    }

    fn remaining(&self, limit: u32, window_ms: i64, now: i64) -> u32 {
        if now - self.window_start >= window_ms {
            limit
        } else {
            limit.saturating_sub(self.count)
        }
    }
}

#[derive(Debug)]
pub struct FixedWindowLimiter {
    settings: WindowSettings,
    clock: SharedClock,
    windows: KeyedState<FixedWindow>,
}

impl FixedWindowLimiter {
    pub fn new(settings: WindowSettings) -> Result<Self> {
        Self::with_clock(settings, clock::system_clock())
    }

    pub fn with_clock(settings: WindowSettings, clock: SharedClock) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            clock,
            windows: KeyedState::new(),
        })
    }

    pub fn get_settings(&self) -> &WindowSettings {
        &self.settings
    }

    pub fn get_window(&self, key: &str) -> Option<FixedWindow> {
        self.windows.peek(key, |window| window.clone())
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn name(&self) -> &'static str {
        "fixed-window"
    }

    fn allow(&self, key: &str) -> bool {
        let now = self.clock.now_millis();
        let window_ms = self.settings.window_millis();
        let limit = self.settings.limit;
        self.windows.with_state(
            key,
            || FixedWindow::new(now),
            |window| {
                window.roll(window_ms, now);
                if window.count < limit {
                    window.count += 1;
                    true
                } else {
                    false
                }
            },
        )
    }

    fn calls_remaining(&self, key: &str) -> u32 {
        let now = self.clock.now_millis();
        let window_ms = self.settings.window_millis();
        self.windows
            .peek(key, |window| window.remaining(self.settings.limit, window_ms, now))
            .unwrap_or(self.settings.limit)
    }

    fn reset(&self, key: &str) -> bool {
        self.windows.remove(key)
    }

    fn expire_keys(&self) -> usize {
        let threshold = self.settings.window_millis().saturating_mul(2);
        let cutoff = self.clock.now_millis().saturating_sub(threshold);
        self.windows.sweep(|window| window.window_start <= cutoff)
    }

    fn len(&self) -> usize {
        self.windows.len()
    }
}
