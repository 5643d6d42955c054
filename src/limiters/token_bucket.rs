//! Token bucket rate limiting algorithm
use crate::clock::{self, SharedClock};
use crate::error::Result;
use crate::settings::TokenBucketSettings;

use super::keyed_state::KeyedState;
use super::RateLimiter;

/// Token bucket for rate limiting
#[derive(Clone, Debug, PartialEq)]
pub struct TokenBucket {
    pub tokens: f64,
    pub last_call: i64,
}

impl TokenBucket {
    /// A full bucket
    pub fn new(capacity: u32, now: i64) -> Self {
        TokenBucket {
            tokens: f64::from(capacity),
            last_call: now,
        }
    }

    /// Function for adding tokens to the bucket.
    /// Tokens are added at the rate of refill_rate * time_since_last_refill
    pub fn add_tokens_to_bucket(&mut self, settings: &TokenBucketSettings, now: i64) -> &mut Self {
        let diff_ms = now - self.last_call;
        // A clock that went backwards refills nothing
        if diff_ms <= 0 {
            return self;
        }
        // multiply before dividing so whole seconds refill whole tokens
        let tokens_to_add = diff_ms as f64 * settings.refill_per_second / 1000.0;
        self.tokens = (self.tokens + tokens_to_add).clamp(0.0, f64::from(settings.capacity));
        self.last_call = now;
        self
    }

    /// Subtract a full token (represents a request)
    pub fn decrement(&mut self) -> &mut Self {
        self.tokens = (self.tokens - 1.0).max(0.0);
        self
    }

    /// Check if rate-limited.
    /// Must have at least 1 full token
    pub fn check_if_allowed(&self) -> bool {
        self.tokens >= 1.0
    }

    /// Return number of tokens as u32, clamped to u32 range
    pub fn tokens_to_u32(&self) -> u32 {
        self.tokens.trunc().clamp(0.0, u32::MAX.into()) as u32
    }
}

/// Each rate-limited key gets its own `TokenBucket`
#[derive(Debug)]
pub struct TokenBucketLimiter {
    settings: TokenBucketSettings,
    clock: SharedClock,
    buckets: KeyedState<TokenBucket>,
}

impl TokenBucketLimiter {
    pub fn new(settings: TokenBucketSettings) -> Result<Self> {
        Self::with_clock(settings, clock::system_clock())
    }

    pub fn with_clock(settings: TokenBucketSettings, clock: SharedClock) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            clock,
            buckets: KeyedState::new(),
        })
    }

    pub fn get_settings(&self) -> &TokenBucketSettings {
        &self.settings
    }

    /// Snapshot of a key's bucket, if it exists
    pub fn get_bucket(&self, key: &str) -> Option<TokenBucket> {
        self.buckets.peek(key, |bucket| bucket.clone())
    }
}

impl RateLimiter for TokenBucketLimiter {
    fn name(&self) -> &'static str {
        "token-bucket"
    }

    fn allow(&self, key: &str) -> bool {
        let now = self.clock.now_millis();
        let capacity = self.settings.capacity;
        self.buckets.with_state(
            key,
            || TokenBucket::new(capacity, now),
            |bucket| {
                bucket.add_tokens_to_bucket(&self.settings, now);
                if bucket.check_if_allowed() {
                    // We only count this call if client is allowed to proceed
                    bucket.decrement();
                    true
                } else {
                    false
                }
            },
        )
    }

    fn calls_remaining(&self, key: &str) -> u32 {
        let now = self.clock.now_millis();
        self.buckets
            .peek(key, |bucket| {
                let mut bucket = bucket.clone();
                bucket.add_tokens_to_bucket(&self.settings, now);
                bucket.tokens_to_u32()
            })
            .unwrap_or(self.settings.capacity)
    }

    fn reset(&self, key: &str) -> bool {
        self.buckets.remove(key)
    }

    /// A bucket untouched for twice its full refill time is full again, so
    /// dropping it loses nothing.
    fn expire_keys(&self) -> usize {
        let threshold = clock::duration_millis(self.settings.full_refill()).saturating_mul(2);
        let cutoff = self.clock.now_millis().saturating_sub(threshold);
        self.buckets.sweep(|bucket| bucket.last_call <= cutoff)
    }

    fn len(&self) -> usize {
        self.buckets.len()
    }
}
