//! Cache-aside (lazy loading)
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::Result;

use super::{BackingStore, Cache};

/// Reads fill the cache on a miss; writes go to the store and invalidate
/// the cached copy, so the next read loads the new value.
pub struct CacheAside<V> {
    cache: Arc<dyn Cache<V>>,
    store: Arc<dyn BackingStore<V>>,
    ttl: Option<Duration>,
}

impl<V: Clone + Send + Sync + 'static> CacheAside<V> {
    pub fn new(cache: Arc<dyn Cache<V>>, store: Arc<dyn BackingStore<V>>) -> Self {
        Self {
            cache,
            store,
            ttl: None,
        }
    }

    /// Entries filled on a miss expire after `ttl`
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn cache(&self) -> &Arc<dyn Cache<V>> {
        &self.cache
    }

    pub async fn get(&self, key: &str) -> Result<Option<V>> {
        if let Some(value) = self.cache.get(key) {
            return Ok(Some(value));
        }
        debug!("[cache-aside] Miss for {}", key);
        let loaded = self.store.get(key).await?;
        if let Some(value) = &loaded {
            self.cache.set(key, value.clone(), self.ttl);
        }
        Ok(loaded)
    }

    /// Write `value` to the store, then drop the cached copy.
    ///
    /// A failed store write leaves the cache untouched.
    pub async fn update(&self, key: &str, value: V) -> Result<()> {
        self.store.set(key, value).await?;
        self.cache.delete(key);
        Ok(())
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.cache.delete(key)
    }
}
