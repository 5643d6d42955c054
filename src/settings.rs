//! wren settings
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CachePolicy;
use crate::config_error;
use crate::error::Result;
use crate::limiters::Algorithm;

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_VIRTUAL_NODES: usize = 160;

/// Token bucket: a pool of `capacity` permits refilled continuously
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TokenBucketSettings {
    pub capacity: u32,
    pub refill_per_second: f64,
}

impl TokenBucketSettings {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(config_error!("token bucket capacity must be positive"));
        }
        if !(self.refill_per_second.is_finite() && self.refill_per_second > 0.0) {
            return Err(config_error!(
                "token bucket refill rate must be positive, got {}",
                self.refill_per_second
            ));
        }
        if Duration::try_from_secs_f64(f64::from(self.capacity) / self.refill_per_second).is_err() {
            return Err(config_error!(
                "token bucket refill rate {} is too small to fill {} permits",
                self.refill_per_second,
                self.capacity
            ));
        }
        Ok(())
    }

    /// Time for an empty bucket to fill up again. Saturates at
    /// `Duration::MAX` for rates `validate` rejects.
    pub fn full_refill(&self) -> Duration {
        Duration::try_from_secs_f64(f64::from(self.capacity) / self.refill_per_second)
            .unwrap_or(Duration::MAX)
    }
}

/// Leaky bucket: an admission queue of `capacity` drained at a constant rate
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct LeakyBucketSettings {
    pub capacity: u32,
    pub leak_per_second: f64,
}

impl LeakyBucketSettings {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(config_error!("leaky bucket capacity must be positive"));
        }
        if !(self.leak_per_second.is_finite() && self.leak_per_second > 0.0) {
            return Err(config_error!(
                "leaky bucket leak rate must be positive, got {}",
                self.leak_per_second
            ));
        }
        let drain = Duration::try_from_secs_f64(1.0 / self.leak_per_second)
            .ok()
            .and_then(|interval| interval.checked_mul(self.capacity));
        if drain.is_none() {
            return Err(config_error!(
                "leaky bucket leak rate {} is too small to drain {} calls",
                self.leak_per_second,
                self.capacity
            ));
        }
        Ok(())
    }

    /// Interval between two leaks. Saturates at `Duration::MAX` for rates
    /// `validate` rejects.
    pub fn leak_interval(&self) -> Duration {
        Duration::try_from_secs_f64(1.0 / self.leak_per_second).unwrap_or(Duration::MAX)
    }

    /// Time for a full queue to drain
    pub fn full_drain(&self) -> Duration {
        self.leak_interval()
            .checked_mul(self.capacity)
            .unwrap_or(Duration::MAX)
    }
}

/// Shared by the fixed window, sliding log and sliding counter limiters
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct WindowSettings {
    pub limit: u32,
    #[serde(with = "millis")]
    pub window: Duration,
}

impl WindowSettings {
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(config_error!("window limit must be positive"));
        }
        if self.window.as_millis() == 0 {
            return Err(config_error!("window must be at least one millisecond"));
        }
        Ok(())
    }

    pub fn window_millis(&self) -> i64 {
        crate::clock::duration_millis(self.window)
    }
}

/// Settings for any member of the limiter family
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "algorithm", rename_all = "kebab-case")]
pub enum LimiterSettings {
    TokenBucket(TokenBucketSettings),
    LeakyBucket(LeakyBucketSettings),
    FixedWindow(WindowSettings),
    SlidingLog(WindowSettings),
    SlidingCounter(WindowSettings),
}

impl LimiterSettings {
    /// Build settings for `algorithm` from a "max calls per interval" pair.
    ///
    /// Buckets get `max_calls` as capacity and refill/leak at
    /// `max_calls / interval`.
    pub fn from_rate(algorithm: Algorithm, max_calls: u32, interval: Duration) -> Self {
        let per_second = f64::from(max_calls) / interval.as_secs_f64();
        let window = WindowSettings {
            limit: max_calls,
            window: interval,
        };
        match algorithm {
            Algorithm::TokenBucket => LimiterSettings::TokenBucket(TokenBucketSettings {
                capacity: max_calls,
                refill_per_second: per_second,
            }),
            Algorithm::LeakyBucket => LimiterSettings::LeakyBucket(LeakyBucketSettings {
                capacity: max_calls,
                leak_per_second: per_second,
            }),
            Algorithm::FixedWindow => LimiterSettings::FixedWindow(window),
            Algorithm::SlidingLog => LimiterSettings::SlidingLog(window),
            Algorithm::SlidingCounter => LimiterSettings::SlidingCounter(window),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            LimiterSettings::TokenBucket(_) => Algorithm::TokenBucket,
            LimiterSettings::LeakyBucket(_) => Algorithm::LeakyBucket,
            LimiterSettings::FixedWindow(_) => Algorithm::FixedWindow,
            LimiterSettings::SlidingLog(_) => Algorithm::SlidingLog,
            LimiterSettings::SlidingCounter(_) => Algorithm::SlidingCounter,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            LimiterSettings::TokenBucket(s) => s.validate(),
            LimiterSettings::LeakyBucket(s) => s.validate(),
            LimiterSettings::FixedWindow(s)
            | LimiterSettings::SlidingLog(s)
            | LimiterSettings::SlidingCounter(s) => s.validate(),
        }
    }
}

/// Write-behind flushing
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct WriteBehindSettings {
    #[serde(with = "millis")]
    pub flush_interval: Duration,
    pub batch_size: usize,
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub retry_backoff: Duration,
}

impl Default for WriteBehindSettings {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(500),
            batch_size: 100,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

impl WriteBehindSettings {
    pub fn validate(&self) -> Result<()> {
        if self.flush_interval.is_zero() {
            return Err(config_error!("flush interval must be positive"));
        }
        if self.batch_size == 0 {
            return Err(config_error!("flush batch size must be positive"));
        }
        if self.max_attempts == 0 {
            return Err(config_error!("flush max attempts must be at least 1"));
        }
        Ok(())
    }
}

/// Settings for the `wren` simulation binary
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Settings {
    pub limiter: LimiterSettings,

    // Simulated traffic
    pub clients: usize,
    pub requests_per_client: usize,

    // Distributed cache shape
    pub cache_policy: CachePolicy,
    pub cache_nodes: usize,
    pub cache_capacity_per_node: usize,
    pub virtual_nodes: usize,
    pub cache_keys: usize,

    // Print a JSON report instead of log lines
    pub json: bool,
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        self.limiter.validate()?;
        if self.cache_nodes == 0 {
            return Err(config_error!("cache nodes must be positive"));
        }
        if self.cache_capacity_per_node == 0 {
            return Err(config_error!("cache capacity must be positive"));
        }
        if self.virtual_nodes == 0 {
            return Err(config_error!("virtual nodes must be positive"));
        }
        Ok(())
    }
}

/// Serialize a `Duration` as integer milliseconds
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
