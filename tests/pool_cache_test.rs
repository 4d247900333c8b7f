//! Integration tests for the per-database pool cache.

mod common;

use common::{CountingFactory, counting_cache, seeded_dir};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tenant_db::DbError;
use tenant_db::db::{PoolCache, PoolState};

#[tokio::test]
async fn test_concurrent_acquire_creates_one_pool() {
    let dir = seeded_dir().await;
    let factory = Arc::new(CountingFactory::with_delay(dir.path(), Duration::from_millis(50)));
    let cache = counting_cache(&factory);

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.acquire("orquidea").await.map(|h| h.state()) })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), PoolState::Healthy);
    }

    assert_eq!(factory.created(), 1);
    assert_eq!(cache.pool_count().await, 1);
}

#[tokio::test]
async fn test_distinct_databases_get_distinct_pools() {
    let dir = seeded_dir().await;
    let factory = Arc::new(CountingFactory::new(dir.path()));
    let cache = counting_cache(&factory);

    let a = cache.acquire("orquidea").await.unwrap();
    let b = cache.acquire("rosas").await.unwrap();
    assert_eq!(a.database(), "orquidea");
    assert_eq!(b.database(), "rosas");
    assert_eq!(factory.created(), 2);

    let mut names: Vec<_> = cache.stats().await.into_iter().map(|s| s.database).collect();
    names.sort();
    assert_eq!(names, vec!["orquidea", "rosas"]);
}

#[tokio::test]
async fn test_slow_creation_does_not_block_other_databases() {
    let dir = seeded_dir().await;
    let factory = Arc::new(CountingFactory::with_delay_for(
        dir.path(),
        "orquidea",
        Duration::from_secs(2),
    ));
    let cache = counting_cache(&factory);

    let slow = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.acquire("orquidea").await.map(|h| h.state()) })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let start = Instant::now();
    let fast = cache.acquire("rosas").await.unwrap();
    assert!(start.elapsed() < Duration::from_millis(500), "{:?}", start.elapsed());
    assert_eq!(fast.database(), "rosas");
    assert!(!slow.is_finished());

    assert_eq!(slow.await.unwrap().unwrap(), PoolState::Healthy);
    assert_eq!(factory.created(), 2);
}

#[tokio::test]
async fn test_database_names_are_case_insensitive() {
    let dir = seeded_dir().await;
    let factory = Arc::new(CountingFactory::new(dir.path()));
    let cache = counting_cache(&factory);

    cache.acquire("Orquidea").await.unwrap();
    cache.acquire("ORQUIDEA").await.unwrap();
    assert_eq!(factory.created(), 1);
}

#[tokio::test]
async fn test_missing_database_is_not_cached() {
    let dir = seeded_dir().await;
    let factory = Arc::new(CountingFactory::new(dir.path()));
    let cache = counting_cache(&factory);

    for _ in 0..2 {
        let err = cache.acquire("does_not_exist").await.unwrap_err();
        assert!(matches!(err, DbError::ConnectionFailed { .. }), "{err:?}");
    }
    // No entry was left behind, so each attempt went to the factory
    assert_eq!(factory.created(), 2);
    assert_eq!(cache.pool_count().await, 0);
    assert!(cache.stats().await.is_empty());
}

#[tokio::test]
async fn test_empty_database_name() {
    let dir = seeded_dir().await;
    let factory = Arc::new(CountingFactory::new(dir.path()));
    let cache = counting_cache(&factory);

    let err = cache.acquire("  ").await.unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));
    assert_eq!(factory.created(), 0);
}

#[tokio::test]
async fn test_degraded_entry_is_replaced() {
    let dir = seeded_dir().await;
    let factory = Arc::new(CountingFactory::new(dir.path()));
    let cache = counting_cache(&factory);

    let first = cache.acquire("orquidea").await.unwrap();
    first.mark_degraded();
    assert_eq!(first.state(), PoolState::Degraded);

    let second = cache.acquire("orquidea").await.unwrap();
    assert_eq!(second.state(), PoolState::Healthy);
    assert_eq!(factory.created(), 2);
    assert_eq!(cache.pool_count().await, 1);
}

#[tokio::test]
async fn test_evict_closes_and_removes() {
    let dir = seeded_dir().await;
    let factory = Arc::new(CountingFactory::new(dir.path()));
    let cache = counting_cache(&factory);

    drop(cache.acquire("orquidea").await.unwrap());
    assert!(cache.evict("orquidea").await);
    assert!(!cache.evict("orquidea").await);
    assert_eq!(cache.pool_count().await, 0);

    cache.acquire("orquidea").await.unwrap();
    assert_eq!(factory.created(), 2);
}

#[tokio::test]
async fn test_idle_sweep_keeps_busy_pools() {
    let dir = seeded_dir().await;
    let factory = Arc::new(CountingFactory::new(dir.path()));
    let cache = counting_cache(&factory);

    let busy = cache.acquire("orquidea").await.unwrap();
    drop(cache.acquire("rosas").await.unwrap());
    tokio::time::sleep(Duration::from_millis(5)).await;

    let closed = cache.sweep_idle(Duration::ZERO).await;
    assert_eq!(closed, 1);
    assert_eq!(busy.state(), PoolState::Healthy);

    let remaining: Vec<_> = cache.stats().await.into_iter().map(|s| s.database).collect();
    assert_eq!(remaining, vec!["orquidea"]);
}

#[tokio::test]
async fn test_background_cleanup_closes_idle_pools() {
    let dir = seeded_dir().await;
    let factory = Arc::new(CountingFactory::new(dir.path()));
    let cache = PoolCache::new(
        factory.clone(),
        tenant_db::db::PoolCacheConfig {
            idle_timeout: Duration::from_millis(50),
            cleanup_interval: Duration::from_millis(25),
        },
    );

    drop(cache.acquire("orquidea").await.unwrap());
    assert_eq!(cache.pool_count().await, 1);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while cache.pool_count().await > 0 {
        assert!(tokio::time::Instant::now() < deadline, "idle pool was never closed");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_close_all_rejects_new_acquires() {
    let dir = seeded_dir().await;
    let factory = Arc::new(CountingFactory::new(dir.path()));
    let cache = counting_cache(&factory);

    drop(cache.acquire("orquidea").await.unwrap());
    cache.close_all().await;

    assert!(matches!(
        cache.acquire("orquidea").await,
        Err(DbError::ShutDown)
    ));
    assert_eq!(cache.pool_count().await, 0);
}

#[tokio::test]
async fn test_wait_idle_tracks_handles() {
    let dir = seeded_dir().await;
    let factory = Arc::new(CountingFactory::new(dir.path()));
    let cache = counting_cache(&factory);

    let handle = cache.acquire("orquidea").await.unwrap();
    assert_eq!(cache.in_flight(), 1);
    assert!(!cache.wait_idle(Duration::from_millis(20)).await);

    let releaser = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(handle);
    });
    assert!(cache.wait_idle(Duration::from_secs(5)).await);
    releaser.await.unwrap();
    assert_eq!(cache.in_flight(), 0);
}
