//! Caches and caching services
//!
//! [`Cache`] is the common contract of the in-process caches ([`LruCache`],
//! [`LfuCache`] and the ring-sharded [`DistributedCache`]). The services
//! ([`CacheAside`], [`WriteThrough`], [`WriteBehind`] and
//! [`StampedeProtectedCache`]) combine a cache with a [`BackingStore`].
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::{self, SharedClock};
use crate::config_error;
use crate::error::{Result, WrenError};

pub mod cache_aside;
pub mod distributed;
pub mod lfu;
pub mod lru;
pub mod stampede;
pub mod store;
pub mod write_behind;
pub mod write_through;

pub use cache_aside::CacheAside;
pub use distributed::DistributedCache;
pub use lfu::LfuCache;
pub use lru::LruCache;
pub use stampede::StampedeProtectedCache;
pub use store::{BackingStore, InMemoryStore};
pub use write_behind::{WriteBehind, WriteFailure};
pub use write_through::WriteThrough;

/// Internally synchronized key-value cache.
///
/// Entries set with a ttl are reported absent by `get` as soon as the ttl
/// has elapsed, and removed on that read.
pub trait Cache<V>: Send + Sync {
    fn get(&self, key: &str) -> Option<V>;

    fn set(&self, key: &str, value: V, ttl: Option<Duration>);

    /// Returns false if `key` was not cached
    fn delete(&self, key: &str) -> bool;

    fn clear(&self);

    /// Entries held, including expired ones not yet purged
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capacity(&self) -> usize;

    /// Every held key, expired ones included. Does not touch recency or
    /// frequency.
    fn keys(&self) -> Vec<String>;
}

/// A cached value and its absolute expiry in unix millis
#[derive(Clone, Debug, PartialEq)]
pub struct Entry<V> {
    pub value: V,
    pub expires_at: Option<i64>,
}

impl<V> Entry<V> {
    pub fn new(value: V, ttl: Option<Duration>, now: i64) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| now.saturating_add(clock::duration_millis(ttl))),
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    #[default]
    Lru,
    Lfu,
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CachePolicy::Lru => f.write_str("lru"),
            CachePolicy::Lfu => f.write_str("lfu"),
        }
    }
}

impl FromStr for CachePolicy {
    type Err = WrenError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lru" => Ok(CachePolicy::Lru),
            "lfu" => Ok(CachePolicy::Lfu),
            other => Err(config_error!(
                "unknown cache policy '{}', expected lru or lfu",
                other
            )),
        }
    }
}

/// Build an empty cache with the given eviction policy
pub fn new_cache<V>(
    policy: CachePolicy,
    capacity: usize,
    clock: SharedClock,
) -> Result<Arc<dyn Cache<V>>>
where
    V: Clone + Send + Sync + 'static,
{
    let cache: Arc<dyn Cache<V>> = match policy {
        CachePolicy::Lru => Arc::new(LruCache::with_clock(capacity, clock)?),
        CachePolicy::Lfu => Arc::new(LfuCache::with_clock(capacity, clock)?),
    };
    Ok(cache)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn entry_expiry() {
        let forever = Entry::new("v", None, 0);
        assert!(!forever.is_expired(i64::MAX));

        let short = Entry::new("v", Some(Duration::from_millis(100)), 1_000);
        assert_eq!(short.expires_at, Some(1_100));
        assert!(!short.is_expired(1_099));
        assert!(short.is_expired(1_100));
    }

    #[test]
    fn policy_names() {
        assert_eq!("lru".parse::<CachePolicy>(), Ok(CachePolicy::Lru));
        assert_eq!(CachePolicy::Lfu.to_string(), "lfu");
        assert!(matches!(
            "arc".parse::<CachePolicy>(),
            Err(WrenError::Config(_))
        ));
    }

    #[test]
    fn new_cache_builds_each_policy() {
        for policy in [CachePolicy::Lru, CachePolicy::Lfu] {
            let cache = new_cache::<u32>(policy, 2, ManualClock::new(0)).unwrap();
            cache.set("a", 1, None);
            assert_eq!(cache.get("a"), Some(1));
            assert_eq!(cache.capacity(), 2);
        }
        assert!(new_cache::<u32>(CachePolicy::Lfu, 0, ManualClock::new(0)).is_err());
    }
}
