//! Caching services and the distributed limiter against shared collaborators
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use wren::cache::{
    BackingStore, Cache, CacheAside, CachePolicy, DistributedCache, InMemoryStore, LruCache,
    StampedeProtectedCache, WriteBehind, WriteThrough,
};
use wren::clock::ManualClock;
use wren::error::WrenError;
use wren::limiters::{DistributedWindowLimiter, MemoryCounterStore, StoreFailurePolicy};
use wren::settings::{WindowSettings, WriteBehindSettings};

fn store_with_latency(latency: Duration) -> Arc<InMemoryStore<String>> {
    Arc::new(InMemoryStore::new().with_latency(latency))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fifty_concurrent_misses_make_one_store_call() {
    let store = store_with_latency(Duration::from_millis(50));
    store.insert("hot-key", "payload".to_string());
    let cache: Arc<LruCache<String>> = Arc::new(LruCache::new(100).unwrap());
    let service = Arc::new(StampedeProtectedCache::new(cache.clone(), store.clone()));

    let calls = (0..50).map(|_| {
        let service = service.clone();
        tokio::spawn(async move { service.get("hot-key").await })
    });
    for result in join_all(calls).await {
        assert_eq!(result.unwrap(), Ok(Some("payload".to_string())));
    }

    assert_eq!(store.gets(), 1);
    assert_eq!(service.in_flight(), 0);
    assert_eq!(cache.get("hot-key"), Some("payload".to_string()));

    // once the entry is gone, the next miss fetches again
    service.invalidate("hot-key");
    service.get("hot-key").await.unwrap();
    assert_eq!(store.gets(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stampede_protection_over_a_distributed_cache() {
    let store = store_with_latency(Duration::from_millis(20));
    for i in 0..20 {
        store.insert(&format!("key_{}", i), format!("value_{}", i));
    }
    let cache: Arc<DistributedCache<String>> =
        Arc::new(DistributedCache::new(3, CachePolicy::Lru, 100).unwrap());
    let service = Arc::new(StampedeProtectedCache::new(cache.clone(), store.clone()));

    let calls = (0..200).map(|n| {
        let service = service.clone();
        tokio::spawn(async move { service.get(&format!("key_{}", n % 20)).await })
    });
    for result in join_all(calls).await {
        assert!(result.unwrap().unwrap().is_some());
    }
    assert_eq!(store.gets(), 20);
    assert_eq!(cache.len(), 20);
}

#[tokio::test]
async fn test_cache_aside_update_forces_refill() {
    let store = store_with_latency(Duration::ZERO);
    store.insert("profile", "v1".to_string());
    let cache: Arc<LruCache<String>> = Arc::new(LruCache::new(10).unwrap());
    let service = CacheAside::new(cache.clone(), store.clone()).with_ttl(Duration::from_secs(60));

    assert_eq!(service.get("profile").await, Ok(Some("v1".to_string())));
    service.update("profile", "v2".to_string()).await.unwrap();
    assert_eq!(cache.get("profile"), None);
    assert_eq!(service.get("profile").await, Ok(Some("v2".to_string())));
    assert_eq!(store.gets(), 2);
    assert_eq!(store.sets(), 1);
}

#[tokio::test]
async fn test_write_through_never_reports_partial_success() {
    let store = store_with_latency(Duration::ZERO);
    let cache: Arc<LruCache<String>> = Arc::new(LruCache::new(10).unwrap());
    let service = WriteThrough::new(cache.clone(), store.clone());

    service.update("order", "placed".to_string()).await.unwrap();
    assert_eq!(store.peek("order"), Some("placed".to_string()));

    store.set_failing_sets(true);
    let result = service.update("order", "shipped".to_string()).await;
    assert!(matches!(result, Err(WrenError::BackingStore(_))));
    assert_eq!(cache.get("order"), None);
    assert_eq!(store.peek("order"), Some("placed".to_string()));
}

#[tokio::test]
async fn test_write_behind_stop_loses_nothing() {
    let store = store_with_latency(Duration::from_millis(1));
    let cache: Arc<LruCache<String>> = Arc::new(LruCache::new(1_000).unwrap());
    let settings = WriteBehindSettings {
        // long enough that only the final flush runs
        flush_interval: Duration::from_secs(3600),
        batch_size: 7,
        ..WriteBehindSettings::default()
    };
    let service = WriteBehind::new(cache, store.clone(), settings).unwrap();
    for i in 0..100 {
        service.update(&format!("event_{}", i), format!("payload_{}", i));
    }
    assert_eq!(service.pending(), 100);
    assert!(store.is_empty());

    service.stop().await.unwrap();
    assert_eq!(service.pending(), 0);
    assert_eq!(store.len(), 100);
    assert_eq!(store.peek("event_99"), Some("payload_99".to_string()));
    assert!(service.take_failures().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_write_behind_surfaces_persistent_failures() {
    let store = store_with_latency(Duration::ZERO);
    let cache: Arc<LruCache<String>> = Arc::new(LruCache::new(10).unwrap());
    let service = WriteBehind::new(cache, store.clone(), WriteBehindSettings::default()).unwrap();
    store.set_failing_sets(true);
    service.update("a", "1".to_string());
    service.update("b", "2".to_string());

    // default flush every 500ms, three attempts each
    tokio::time::sleep(Duration::from_secs(2)).await;
    let failures = service.take_failures();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().all(|f| f.attempts == 3));
    assert_eq!(store.sets(), 6);
    assert_eq!(service.get("a"), Some("1".to_string()));
    service.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_flushes_keep_latest_value() {
    let store = store_with_latency(Duration::from_millis(5));
    let cache: Arc<LruCache<String>> = Arc::new(LruCache::new(10).unwrap());
    let settings = WriteBehindSettings {
        flush_interval: Duration::from_secs(3600),
        batch_size: 1,
        ..WriteBehindSettings::default()
    };
    let service = Arc::new(WriteBehind::new(cache, store.clone(), settings).unwrap());
    service.update("user:1", "old".to_string());
    service.update("user:1", "new".to_string());
    store.fail_next_sets(1);

    let flushes = (0..4).map(|_| {
        let service = service.clone();
        tokio::spawn(async move { service.flush().await })
    });
    let written: usize = join_all(flushes).await.into_iter().map(|r| r.unwrap()).sum();
    assert_eq!(written, 2);
    assert_eq!(store.peek("user:1"), Some("new".to_string()));
    assert_eq!(service.get("user:1"), Some("new".to_string()));
    assert!(service.take_failures().is_empty());
    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_distributed_limiter_shares_counts_across_instances() {
    let clock = ManualClock::new(0);
    let store = Arc::new(MemoryCounterStore::with_clock(clock.clone()));
    let settings = WindowSettings {
        limit: 4,
        window: Duration::from_secs(1),
    };
    let instances: Vec<DistributedWindowLimiter> = (0..3)
        .map(|_| {
            DistributedWindowLimiter::with_clock(settings.clone(), store.clone(), clock.clone())
                .unwrap()
        })
        .collect();

    let mut admitted = 0;
    for _ in 0..4 {
        for limiter in &instances {
            if limiter.allow("api-key").await.unwrap() {
                admitted += 1;
            }
        }
    }
    assert_eq!(admitted, 4);

    clock.advance(Duration::from_secs(1));
    assert!(instances[2].allow("api-key").await.unwrap());
}

#[tokio::test]
async fn test_distributed_limiter_failure_policy_is_explicit() {
    let clock = ManualClock::new(0);
    let store = Arc::new(MemoryCounterStore::with_clock(clock.clone()));
    let settings = WindowSettings {
        limit: 1,
        window: Duration::from_secs(1),
    };
    let limiter =
        DistributedWindowLimiter::with_clock(settings, store.clone(), clock.clone()).unwrap();
    store.set_failing(true);
    assert!(limiter.allow("k").await.is_err());

    let limiter = limiter.with_failure_policy(StoreFailurePolicy::FailOpen);
    assert_eq!(limiter.allow("k").await, Ok(true));
    let limiter = limiter.with_failure_policy(StoreFailurePolicy::FailClosed);
    assert_eq!(limiter.allow("k").await, Ok(false));
}

#[tokio::test]
async fn test_backing_store_as_trait_object() {
    let store: Arc<dyn BackingStore<u64>> = Arc::new(InMemoryStore::<u64>::new());
    store.set("counter", 1).await.unwrap();
    assert_eq!(store.get("counter").await, Ok(Some(1)));
    assert_eq!(store.get("missing").await, Ok(None));
}
