//! Breaker behavior around the distributed tier: consecutive failures open
//! it, open calls fail fast without reaching the store, and the cool-down
//! admits a probe. Throughout, the cache itself keeps answering (misses),
//! never failing the caller.

use layered_cache::clock::ManualClock;
use layered_cache::disk_space::FixedDiskSpace;
use layered_cache::serializer::{JsonLz4Serializer, Serializer};
use layered_cache::store::InMemoryStore;
use layered_cache::{CacheOptions, LayeredCache, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn build_l3_only_cache() -> (
    LayeredCache<JsonLz4Serializer>,
    Arc<ManualClock>,
    Arc<InMemoryStore>,
) {
    // No file tier: every miss goes straight to the distributed store.
    let options = CacheOptions {
        key_prefix: "brk".to_string(),
        file_directory: String::new(),
        ..CacheOptions::default()
    };
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(InMemoryStore::new(clock.clone()));
    let cache = LayeredCache::with_parts(
        options,
        Some(store.clone() as Arc<dyn layered_cache::Store>),
        JsonLz4Serializer,
        clock.clone(),
        Arc::new(FixedDiskSpace::new(900_000, 1_000_000)),
    )
    .await
    .unwrap();
    (cache, clock, store)
}

#[tokio::test]
async fn five_failures_open_the_breaker_and_cooldown_reenables() {
    let (cache, clock, store) = build_l3_only_cache().await;
    let cancel = CancellationToken::new();

    store.fail_next(10, "connection refused");

    // Five failing reads: every one degrades to a miss, never an error.
    for _ in 0..5 {
        assert_eq!(cache.get::<String>("k", &cancel).await.unwrap(), None);
    }
    assert_eq!(store.get_calls(), 5);

    // Breaker is open: further reads fail fast without touching the store.
    for _ in 0..3 {
        assert_eq!(cache.get::<String>("k", &cancel).await.unwrap(), None);
    }
    assert_eq!(store.get_calls(), 5);

    // After the cool-down the next call is attempted again.
    clock.advance(Duration::from_secs(6));
    assert_eq!(cache.get::<String>("k", &cancel).await.unwrap(), None);
    assert_eq!(store.get_calls(), 6);

    cache.shutdown().await;
}

#[tokio::test]
async fn successful_probe_closes_the_breaker() {
    let (cache, clock, store) = build_l3_only_cache().await;
    let cancel = CancellationToken::new();

    // Seed a value, then force the breaker open.
    cache
        .set(
            "k",
            "v".to_string(),
            layered_cache::CacheParameters::new(Duration::from_secs(300), 128),
            &cancel,
        )
        .await
        .unwrap();
    store.fail_next(5, "connection refused");
    let baseline = store.get_calls();
    for _ in 0..5 {
        // Memory still hits; use a different key to force L3 reads.
        assert_eq!(cache.get::<String>("other", &cancel).await.unwrap(), None);
    }
    assert_eq!(store.get_calls(), baseline + 5);
    assert_eq!(cache.get::<String>("other", &cancel).await.unwrap(), None);
    assert_eq!(store.get_calls(), baseline + 5);

    // Probe succeeds and the tier is healthy again.
    clock.advance(Duration::from_secs(6));
    assert_eq!(cache.get::<String>("other", &cancel).await.unwrap(), None);
    assert_eq!(store.get_calls(), baseline + 6);
    assert_eq!(cache.get::<String>("other", &cancel).await.unwrap(), None);
    assert_eq!(store.get_calls(), baseline + 7);

    cache.shutdown().await;
}

#[tokio::test]
async fn open_breaker_does_not_fail_set_calls() {
    let (cache, _clock, store) = build_l3_only_cache().await;
    let cancel = CancellationToken::new();

    store.fail_next(5, "connection refused");
    for _ in 0..5 {
        let _ = cache.get::<String>("k", &cancel).await.unwrap();
    }

    // Distributed writes are swallowed while the breaker is open; the set
    // call itself still succeeds (memory write-through happened).
    cache
        .set(
            "k",
            "v".to_string(),
            layered_cache::CacheParameters::new(Duration::from_secs(300), 128),
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(
        cache.get::<String>("k", &cancel).await.unwrap(),
        Some("v".to_string())
    );
    assert_eq!(store.set_calls(), 0);

    cache.shutdown().await;
}

#[tokio::test]
async fn replica_errors_reconfigure_and_retry_once() {
    let (cache, _clock, store) = build_l3_only_cache().await;
    let cancel = CancellationToken::new();

    let subscriptions_before = store.subscribe_calls();
    store.fail_next(1, "READONLY cannot write against a read only replica");

    cache
        .set(
            "k",
            "v".to_string(),
            layered_cache::CacheParameters::new(Duration::from_secs(300), 128),
            &cancel,
        )
        .await
        .unwrap();

    // The adapter healed: reconfigure, fresh subscription, retried write.
    assert_eq!(store.reconfigure_calls(), 1);
    assert!(store.subscribe_calls() > subscriptions_before);
    let formatted = cache.format_key::<String>("k");
    assert!(store.contains(&formatted));

    cache.shutdown().await;
}

#[tokio::test]
async fn non_replica_errors_do_not_reconfigure() {
    let (cache, _clock, store) = build_l3_only_cache().await;
    let cancel = CancellationToken::new();

    store.fail_next(1, "timeout talking to backend");
    let value = cache.get::<String>("k", &cancel).await.unwrap();
    assert_eq!(value, None);
    assert_eq!(store.reconfigure_calls(), 0);

    cache.shutdown().await;
}

#[tokio::test]
async fn undecodable_distributed_payload_degrades_to_miss() {
    let (cache, _clock, store) = build_l3_only_cache().await;
    let cancel = CancellationToken::new();

    let formatted = cache.format_key::<String>("k");
    store
        .set(&formatted, b"not an lz4 frame", Duration::from_secs(300))
        .await
        .unwrap();

    assert_eq!(cache.get::<String>("k", &cancel).await.unwrap(), None);

    cache.shutdown().await;
}

#[tokio::test]
async fn distributed_round_trip_uses_the_serializer() {
    let (cache, _clock, store) = build_l3_only_cache().await;
    let cancel = CancellationToken::new();

    let formatted = cache.format_key::<u64>("answer");
    let bytes = JsonLz4Serializer.serialize(&42u64).unwrap();
    store
        .set(&formatted, &bytes, Duration::from_secs(300))
        .await
        .unwrap();

    assert_eq!(cache.get::<u64>("answer", &cancel).await.unwrap(), Some(42));

    cache.shutdown().await;
}
