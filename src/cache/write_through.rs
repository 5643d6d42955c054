//! Write-through caching
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::error::Result;

use super::{BackingStore, Cache};

/// Writes go to the cache and the store as one operation. If the store
/// write fails, the cached copy is dropped and the error is returned, so
/// the cache never holds a value the store refused.
pub struct WriteThrough<V> {
    cache: Arc<dyn Cache<V>>,
    store: Arc<dyn BackingStore<V>>,
    ttl: Option<Duration>,
}

impl<V: Clone + Send + Sync + 'static> WriteThrough<V> {
    pub fn new(cache: Arc<dyn Cache<V>>, store: Arc<dyn BackingStore<V>>) -> Self {
        Self {
            cache,
            store,
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Read from the cache, falling back to the store and filling on a miss
    pub async fn get(&self, key: &str) -> Result<Option<V>> {
        if let Some(value) = self.cache.get(key) {
            return Ok(Some(value));
        }
        let loaded = self.store.get(key).await?;
        if let Some(value) = &loaded {
            self.cache.set(key, value.clone(), self.ttl);
        }
        Ok(loaded)
    }

    pub async fn update(&self, key: &str, value: V) -> Result<()> {
        self.cache.set(key, value.clone(), self.ttl);
        if let Err(err) = self.store.set(key, value).await {
            self.cache.delete(key);
            warn!("[write-through] Store write for {} failed: {}", key, err);
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{InMemoryStore, LruCache};
    use crate::error::WrenError;

    fn setup() -> (WriteThrough<u64>, Arc<LruCache<u64>>, Arc<InMemoryStore<u64>>) {
        let cache: Arc<LruCache<u64>> = Arc::new(LruCache::new(10).unwrap());
        let store: Arc<InMemoryStore<u64>> = Arc::new(InMemoryStore::new());
        let service = WriteThrough::new(cache.clone(), store.clone());
        (service, cache, store)
    }

    #[tokio::test]
    async fn update_writes_both() {
        let (service, cache, store) = setup();
        service.update("balance", 100).await.unwrap();
        assert_eq!(cache.get("balance"), Some(100));
        assert_eq!(store.peek("balance"), Some(100));
        assert_eq!(service.get("balance").await, Ok(Some(100)));
        assert_eq!(store.gets(), 0);
    }

    #[tokio::test]
    async fn store_failure_is_surfaced_and_leaves_no_cache_entry() {
        let (service, cache, store) = setup();
        service.update("balance", 100).await.unwrap();
        store.fail_next_sets(1);

        let result = service.update("balance", 250).await;
        assert!(matches!(result, Err(WrenError::BackingStore(_))));
        assert_eq!(cache.get("balance"), None);
        // next read sees what the store actually holds
        assert_eq!(service.get("balance").await, Ok(Some(100)));
    }

    #[tokio::test]
    async fn get_reads_through_on_miss() {
        let (service, cache, store) = setup();
        store.insert("seeded", 7);
        assert_eq!(service.get("seeded").await, Ok(Some(7)));
        assert_eq!(cache.get("seeded"), Some(7));
    }
}
