//! Stampede protection
//!
//! Concurrent misses on one key share a single backing-store fetch. The
//! first miss installs an in-flight marker holding a [`Shared`] future;
//! later misses clone and await it. The fetch fills the cache and removes
//! its own marker before resolving, success or failure, so the next miss
//! after that starts a fresh fetch.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;

use super::{BackingStore, Cache};

type SharedFetch<V> = Shared<BoxFuture<'static, Result<Option<V>>>>;

pub struct StampedeProtectedCache<V> {
    cache: Arc<dyn Cache<V>>,
    store: Arc<dyn BackingStore<V>>,
    ttl: Option<Duration>,
    in_flight: Arc<Mutex<HashMap<String, SharedFetch<V>>>>,
}

impl<V: Clone + Send + Sync + 'static> StampedeProtectedCache<V> {
    pub fn new(cache: Arc<dyn Cache<V>>, store: Arc<dyn BackingStore<V>>) -> Self {
        Self {
            cache,
            store,
            ttl: None,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Keys with a fetch currently in flight
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.cache.delete(key)
    }

    pub async fn get(&self, key: &str) -> Result<Option<V>> {
        if let Some(value) = self.cache.get(key) {
            return Ok(Some(value));
        }

        let fetch = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(key) {
                Some(existing) => {
                    debug!("[stampede] Joining in-flight fetch for {}", key);
                    existing.clone()
                }
                None => {
                    // A fetch may have completed between the first check and
                    // taking the lock
                    if let Some(value) = self.cache.get(key) {
                        return Ok(Some(value));
                    }
                    let fetch = self.fetch(key).boxed().shared();
                    in_flight.insert(key.to_string(), fetch.clone());
                    fetch
                }
            }
        };

        fetch.await
    }

    fn fetch(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<V>>> + Send + 'static {
        let key = key.to_string();
        let cache = self.cache.clone();
        let store = self.store.clone();
        let in_flight = self.in_flight.clone();
        let ttl = self.ttl;
        async move {
            debug!("[stampede] Fetching {} from backing store", key);
            let result = store.get(&key).await;
            if let Ok(Some(value)) = &result {
                cache.set(&key, value.clone(), ttl);
            }
            in_flight.lock().remove(&key);
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::future::join_all;

    use super::*;
    use crate::cache::{InMemoryStore, LruCache};

    fn setup(latency: Duration) -> (Arc<StampedeProtectedCache<String>>, Arc<InMemoryStore<String>>) {
        let cache: Arc<LruCache<String>> = Arc::new(LruCache::new(10).unwrap());
        let store: Arc<InMemoryStore<String>> =
            Arc::new(InMemoryStore::new().with_latency(latency));
        let service = Arc::new(StampedeProtectedCache::new(cache, store.clone()));
        (service, store)
    }

    #[tokio::test(start_paused = true)]
    async fn fifty_concurrent_misses_fetch_once() {
        let (service, store) = setup(Duration::from_millis(100));
        store.insert("hot", "value".to_string());

        let calls = (0..50).map(|_| {
            let service = service.clone();
            tokio::spawn(async move { service.get("hot").await })
        });
        let results = join_all(calls).await;

        for result in results {
            assert_eq!(result.unwrap(), Ok(Some("value".to_string())));
        }
        assert_eq!(store.gets(), 1);
        assert_eq!(service.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn marker_removed_after_failure() {
        let (service, store) = setup(Duration::from_millis(10));
        store.insert("key", "value".to_string());
        store.set_failing_gets(true);

        let (first, second) = tokio::join!(service.get("key"), service.get("key"));
        assert!(first.is_err());
        assert_eq!(first, second);
        assert_eq!(store.gets(), 1);
        assert_eq!(service.in_flight(), 0);

        store.set_failing_gets(false);
        assert_eq!(service.get("key").await, Ok(Some("value".to_string())));
        assert_eq!(store.gets(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn absent_values_are_shared_but_not_cached() {
        let (service, store) = setup(Duration::from_millis(10));
        let (first, second) = tokio::join!(service.get("ghost"), service.get("ghost"));
        assert_eq!(first, Ok(None));
        assert_eq!(second, Ok(None));
        assert_eq!(store.gets(), 1);

        assert_eq!(service.get("ghost").await, Ok(None));
        assert_eq!(store.gets(), 2);
    }

    #[tokio::test]
    async fn hits_skip_the_store() {
        let (service, store) = setup(Duration::ZERO);
        store.insert("key", "value".to_string());
        service.get("key").await.unwrap();
        service.get("key").await.unwrap();
        assert_eq!(store.gets(), 1);
        assert!(service.invalidate("key"));
        service.get("key").await.unwrap();
        assert_eq!(store.gets(), 2);
    }
}
