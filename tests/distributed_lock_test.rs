//! Distributed lock acquisition through the cache façade: exclusivity,
//! single-attempt timeouts, scoped release, and hold expiry.

use layered_cache::clock::SystemClock;
use layered_cache::disk_space::FixedDiskSpace;
use layered_cache::serializer::JsonLz4Serializer;
use layered_cache::store::InMemoryStore;
use layered_cache::{CacheOptions, LayeredCache};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn build_cache() -> (LayeredCache<JsonLz4Serializer>, Arc<InMemoryStore>) {
    let options = CacheOptions {
        key_prefix: "locks".to_string(),
        file_directory: String::new(),
        ..CacheOptions::default()
    };
    let clock = Arc::new(SystemClock);
    let store = Arc::new(InMemoryStore::new(clock.clone()));
    let cache = LayeredCache::with_parts(
        options,
        Some(store.clone() as Arc<dyn layered_cache::Store>),
        JsonLz4Serializer,
        clock,
        Arc::new(FixedDiskSpace::new(900_000, 1_000_000)),
    )
    .await
    .unwrap();
    (cache, store)
}

#[tokio::test]
async fn lock_is_exclusive_and_released_on_release() {
    let (cache, _store) = build_cache().await;
    let cancel = CancellationToken::new();

    let guard = cache
        .try_acquire_lock("job-1", Duration::from_secs(30), Duration::ZERO, &cancel)
        .await
        .unwrap()
        .expect("first caller should take the lock");

    // Single attempt (timeout zero) against a held lock fails.
    let second = cache
        .try_acquire_lock("job-1", Duration::from_secs(30), Duration::ZERO, &cancel)
        .await
        .unwrap();
    assert!(second.is_none());

    guard.release().await.unwrap();

    let third = cache
        .try_acquire_lock("job-1", Duration::from_secs(30), Duration::ZERO, &cancel)
        .await
        .unwrap();
    assert!(third.is_some());

    cache.shutdown().await;
}

#[tokio::test]
async fn retries_win_once_the_holder_releases() {
    let (cache, _store) = build_cache().await;
    let cancel = CancellationToken::new();

    let guard = cache
        .try_acquire_lock("job-2", Duration::from_secs(30), Duration::ZERO, &cancel)
        .await
        .unwrap()
        .expect("initial acquire");

    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        guard.release().await.unwrap();
    });

    // Retry loop (100 ms back-off) outlasts the holder.
    let contender = cache
        .try_acquire_lock(
            "job-2",
            Duration::from_secs(30),
            Duration::from_secs(5),
            &cancel,
        )
        .await
        .unwrap();
    assert!(contender.is_some());

    release.await.unwrap();
    cache.shutdown().await;
}

#[tokio::test]
async fn acquisition_times_out_against_a_stuck_holder() {
    let (cache, _store) = build_cache().await;
    let cancel = CancellationToken::new();

    let _held = cache
        .try_acquire_lock("job-3", Duration::from_secs(60), Duration::ZERO, &cancel)
        .await
        .unwrap()
        .expect("initial acquire");

    let result = cache
        .try_acquire_lock(
            "job-3",
            Duration::from_secs(60),
            Duration::from_millis(350),
            &cancel,
        )
        .await
        .unwrap();
    assert!(result.is_none());

    cache.shutdown().await;
}

#[tokio::test]
async fn dropped_guard_eventually_unlocks() {
    let (cache, store) = build_cache().await;
    let cancel = CancellationToken::new();

    {
        let _guard = cache
            .try_acquire_lock("job-4", Duration::from_secs(60), Duration::ZERO, &cancel)
            .await
            .unwrap()
            .expect("initial acquire");
        // Guard dropped here without an explicit release.
    }

    // The drop spawns a best-effort unlock; wait for it to land.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        let retry = cache
            .try_acquire_lock("job-4", Duration::from_secs(60), Duration::ZERO, &cancel)
            .await
            .unwrap();
        if retry.is_some() {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "dropped guard never released the lock"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    drop(store);
    cache.shutdown().await;
}

#[tokio::test]
async fn cancellation_aborts_the_retry_loop() {
    let (cache, _store) = build_cache().await;
    let cancel = CancellationToken::new();

    let _held = cache
        .try_acquire_lock("job-5", Duration::from_secs(60), Duration::ZERO, &cancel)
        .await
        .unwrap()
        .expect("initial acquire");

    let waiter_cancel = cancel.clone();
    let waiter = tokio::spawn({
        let cache_cancel = waiter_cancel.clone();
        async move {
            // This would retry for 30 s if not cancelled.
            let result = cache
                .try_acquire_lock(
                    "job-5",
                    Duration::from_secs(60),
                    Duration::from_secs(30),
                    &cache_cancel,
                )
                .await;
            (cache, result)
        }
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    waiter_cancel.cancel();

    let (cache, result) = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("cancellation must abort the retry loop promptly")
        .unwrap();
    assert!(matches!(
        result,
        Err(layered_cache::CacheError::Cancelled(_))
    ));

    cache.shutdown().await;
}
