//! Rate limiting algorithms
//!
//! Every algorithm implements [`RateLimiter`]. [`Limiter`] is the closed set
//! of in-process limiters, built from [`LimiterSettings`].
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::{self, SharedClock};
use crate::config_error;
use crate::error::{Result, WrenError};
use crate::settings::LimiterSettings;
use crate::task::{PeriodicJob, PeriodicTask};

pub mod distributed_window;
pub mod fixed_window;
pub mod keyed_state;
pub mod leaky_bucket;
pub mod sliding_counter;
pub mod sliding_log;
pub mod token_bucket;

pub use distributed_window::{
    CounterStore, DistributedWindowLimiter, MemoryCounterStore, StoreFailurePolicy,
};
pub use fixed_window::FixedWindowLimiter;
pub use leaky_bucket::LeakyBucketLimiter;
pub use sliding_counter::SlidingCounterLimiter;
pub use sliding_log::SlidingLogLimiter;
pub use token_bucket::TokenBucketLimiter;

/// Per-key admission control.
///
/// Being throttled is an expected outcome, so `allow` answers with a `bool`
/// rather than an error. State for a key is created on its first `allow`.
pub trait RateLimiter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Admit or deny one call for `key`, recording it when admitted
    fn allow(&self, key: &str) -> bool;

    /// How many calls `key` could make right now. Never creates state.
    fn calls_remaining(&self, key: &str) -> u32;

    /// Forget everything about `key`. Returns false if it had no state.
    fn reset(&self, key: &str) -> bool;

    /// Drop state for keys that have gone idle. Returns the number removed.
    fn expire_keys(&self) -> usize;

    /// Number of keys with state
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    TokenBucket,
    LeakyBucket,
    FixedWindow,
    SlidingLog,
    SlidingCounter,
}

impl Algorithm {
    pub const ALL: [Algorithm; 5] = [
        Algorithm::TokenBucket,
        Algorithm::LeakyBucket,
        Algorithm::FixedWindow,
        Algorithm::SlidingLog,
        Algorithm::SlidingCounter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::TokenBucket => "token-bucket",
            Algorithm::LeakyBucket => "leaky-bucket",
            Algorithm::FixedWindow => "fixed-window",
            Algorithm::SlidingLog => "sliding-log",
            Algorithm::SlidingCounter => "sliding-counter",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = WrenError;

    fn from_str(s: &str) -> Result<Self> {
        Algorithm::ALL
            .into_iter()
            .find(|algorithm| algorithm.as_str() == s)
            .ok_or_else(|| {
                config_error!(
                    "unknown algorithm '{}', expected one of: {}",
                    s,
                    Algorithm::ALL.map(|a| a.as_str()).join(", ")
                )
            })
    }
}

/// Any of the in-process limiters
#[derive(Debug)]
pub enum Limiter {
    TokenBucket(TokenBucketLimiter),
    LeakyBucket(LeakyBucketLimiter),
    FixedWindow(FixedWindowLimiter),
    SlidingLog(SlidingLogLimiter),
    SlidingCounter(SlidingCounterLimiter),
}

impl Limiter {
    /// Build the limiter described by `settings`.
    ///
    /// The leaky bucket starts its leak task here, so this must run inside a
    /// tokio runtime when `settings` selects it.
    pub fn from_settings(settings: &LimiterSettings) -> Result<Self> {
        Self::with_clock(settings, clock::system_clock())
    }

    pub fn with_clock(settings: &LimiterSettings, clock: SharedClock) -> Result<Self> {
        let limiter = match settings {
            LimiterSettings::TokenBucket(s) => {
                Limiter::TokenBucket(TokenBucketLimiter::with_clock(s.clone(), clock)?)
            }
            LimiterSettings::LeakyBucket(s) => {
                Limiter::LeakyBucket(LeakyBucketLimiter::with_clock(s.clone(), clock)?)
            }
            LimiterSettings::FixedWindow(s) => {
                Limiter::FixedWindow(FixedWindowLimiter::with_clock(s.clone(), clock)?)
            }
            LimiterSettings::SlidingLog(s) => {
                Limiter::SlidingLog(SlidingLogLimiter::with_clock(s.clone(), clock)?)
            }
            LimiterSettings::SlidingCounter(s) => {
                Limiter::SlidingCounter(SlidingCounterLimiter::with_clock(s.clone(), clock)?)
            }
        };
        debug!("Built {} limiter", limiter.name());
        Ok(limiter)
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            Limiter::TokenBucket(_) => Algorithm::TokenBucket,
            Limiter::LeakyBucket(_) => Algorithm::LeakyBucket,
            Limiter::FixedWindow(_) => Algorithm::FixedWindow,
            Limiter::SlidingLog(_) => Algorithm::SlidingLog,
            Limiter::SlidingCounter(_) => Algorithm::SlidingCounter,
        }
    }

    fn inner(&self) -> &dyn RateLimiter {
        match self {
            Limiter::TokenBucket(l) => l,
            Limiter::LeakyBucket(l) => l,
            Limiter::FixedWindow(l) => l,
            Limiter::SlidingLog(l) => l,
            Limiter::SlidingCounter(l) => l,
        }
    }

    /// Stop background work owned by the limiter (the leak task). A no-op
    /// for the others.
    pub async fn stop(&self) -> Result<()> {
        match self {
            Limiter::LeakyBucket(l) => l.stop().await,
            _ => Ok(()),
        }
    }
}

impl RateLimiter for Limiter {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn allow(&self, key: &str) -> bool {
        self.inner().allow(key)
    }

    fn calls_remaining(&self, key: &str) -> u32 {
        self.inner().calls_remaining(key)
    }

    fn reset(&self, key: &str) -> bool {
        self.inner().reset(key)
    }

    fn expire_keys(&self) -> usize {
        self.inner().expire_keys()
    }

    fn len(&self) -> usize {
        self.inner().len()
    }
}

struct ExpireKeysJob<L: ?Sized> {
    limiter: Arc<L>,
}

#[async_trait]
impl<L: RateLimiter + ?Sized + 'static> PeriodicJob for ExpireKeysJob<L> {
    async fn tick(&mut self) {
        let removed = self.limiter.expire_keys();
        if removed > 0 {
            debug!(
                "[{}] Expired {} idle keys, {} remaining",
                self.limiter.name(),
                removed,
                self.limiter.len()
            );
        }
    }
}

/// Run `expire_keys` on `limiter` every `period` until the returned task is
/// stopped.
pub fn spawn_expiry_sweep<L>(limiter: Arc<L>, period: Duration) -> Result<PeriodicTask>
where
    L: RateLimiter + ?Sized + 'static,
{
    let name = format!("{}-expiry", limiter.name());
    PeriodicTask::spawn(name, period, ExpireKeysJob { limiter })
}
