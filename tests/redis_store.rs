//! Redis event store tests. Run with a live server:
//!
//! ```text
//! REDIS_URL=redis://127.0.0.1:6379 cargo test --test redis_store -- --ignored
//! ```

use std::sync::Arc;

use tollgate::ratelimit::{AdmissionEngine, ManualClock, PolicyRegistry, Reaper};
use tollgate::store::{EventStore, RateLimitEvent, RedisEventStore};

async fn store() -> RedisEventStore {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let prefix = format!("tollgate-test-{}", uuid::Uuid::new_v4());
    RedisEventStore::connect(&url, &prefix).await.unwrap()
}

#[tokio::test]
#[ignore = "requires a running Redis server (REDIS_URL)"]
async fn test_count_is_strictly_after() {
    let store = store().await;
    for ts in [100, 110, 120] {
        store
            .append(RateLimitEvent::bare("ip_1", "login", ts))
            .await
            .unwrap();
    }

    let window = store.count_events("ip_1", "login", 100).await.unwrap();
    assert_eq!(window.count, 2);
    assert_eq!(window.oldest, Some(110));

    let window = store.count_events("ip_1", "signup", 0).await.unwrap();
    assert_eq!(window.count, 0);
    assert_eq!(window.oldest, None);

    store.delete_before(i64::MAX).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running Redis server (REDIS_URL)"]
async fn test_duplicate_events_are_counted() {
    let store = store().await;
    store.append(RateLimitEvent::bare("ip_1", "login", 50)).await.unwrap();
    store.append(RateLimitEvent::bare("ip_1", "login", 50)).await.unwrap();

    assert_eq!(store.count_events("ip_1", "login", 0).await.unwrap().count, 2);
    store.delete_before(i64::MAX).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running Redis server (REDIS_URL)"]
async fn test_delete_before_and_statistics() {
    let store = store().await;
    store.append(RateLimitEvent::bare("ip_1", "api", 10)).await.unwrap();
    store.append(RateLimitEvent::bare("ip_1", "api", 500)).await.unwrap();
    store.append(RateLimitEvent::bare("ip_2", "api", 600)).await.unwrap();

    assert_eq!(store.delete_before(100).await.unwrap(), 1);

    let stats = store.statistics(0).await.unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].total_requests, 2);
    assert_eq!(stats[0].unique_clients, 2);

    assert_eq!(store.delete_before(i64::MAX).await.unwrap(), 2);
    assert!(store.statistics(0).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires a running Redis server (REDIS_URL)"]
async fn test_engine_over_redis() {
    let store = Arc::new(store().await);
    let policies = Arc::new(PolicyRegistry::with_default_tiers());
    let clock = ManualClock::new(1_000);
    let engine = AdmissionEngine::new(store.clone(), policies)
        .with_clock(Arc::new(clock.clone()))
        .with_reaper(Reaper::disabled());

    for _ in 0..5 {
        assert!(engine.admit("ip_10.0.0.1", "auth").await.allowed);
    }
    let denied = engine.admit("ip_10.0.0.1", "auth").await;
    assert!(!denied.allowed);
    assert_eq!(denied.retry_after, 300);

    clock.advance(300);
    assert!(engine.admit("ip_10.0.0.1", "auth").await.allowed);

    store.delete_before(i64::MAX).await.unwrap();
}
