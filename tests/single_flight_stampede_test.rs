//! Stampede protection: many concurrent `get_or_create` callers for the
//! same key must share exactly one factory execution.

use layered_cache::clock::SystemClock;
use layered_cache::disk_space::FixedDiskSpace;
use layered_cache::serializer::JsonLz4Serializer;
use layered_cache::{CacheError, CacheOptions, LayeredCache};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;

const CALLERS: usize = 500;

async fn build_cache(temp_dir: &TempDir) -> Arc<LayeredCache<JsonLz4Serializer>> {
    let options = CacheOptions {
        key_prefix: "stampede".to_string(),
        file_directory: temp_dir.path().to_string_lossy().into_owned(),
        reclaim_interval: Duration::from_secs(3600),
        ..CacheOptions::default()
    };
    Arc::new(
        LayeredCache::with_parts(
            options,
            None,
            JsonLz4Serializer,
            Arc::new(SystemClock),
            Arc::new(FixedDiskSpace::new(900_000, 1_000_000)),
        )
        .await
        .unwrap(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn slow_factory_runs_exactly_once() {
    let temp_dir = TempDir::new().unwrap();
    let cache = build_cache(&temp_dir).await;

    let factory_calls = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(CALLERS));

    let mut handles = Vec::with_capacity(CALLERS);
    for _ in 0..CALLERS {
        let cache = cache.clone();
        let factory_calls = factory_calls.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            let cancel = CancellationToken::new();
            cache
                .get_or_create::<String, _, _>(
                    "a",
                    move |_ctx| async move {
                        factory_calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(Some("1".to_string()))
                    },
                    None,
                    &cancel,
                )
                .await
        }));
    }

    for handle in handles {
        let value = handle.await.unwrap().unwrap();
        assert_eq!(value, Some("1".to_string()));
    }
    assert_eq!(factory_calls.load(Ordering::SeqCst), 1);

    cache.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_factory_rethrows_to_every_waiter() {
    let temp_dir = TempDir::new().unwrap();
    let cache = build_cache(&temp_dir).await;

    let factory_calls = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(64));

    let mut handles = Vec::with_capacity(64);
    for _ in 0..64 {
        let cache = cache.clone();
        let factory_calls = factory_calls.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            let cancel = CancellationToken::new();
            cache
                .get_or_create::<String, _, _>(
                    "boom",
                    move |_ctx| async move {
                        factory_calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        Err(CacheError::InternalError("load failed".to_string()))
                    },
                    None,
                    &cancel,
                )
                .await
        }));
    }

    for handle in handles {
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(CacheError::InternalError(_))));
    }
    assert_eq!(factory_calls.load(Ordering::SeqCst), 1);

    cache.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_keys_do_not_collapse_together() {
    let temp_dir = TempDir::new().unwrap();
    let cache = build_cache(&temp_dir).await;

    let factory_calls = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for i in 0..8 {
        let cache = cache.clone();
        let factory_calls = factory_calls.clone();
        handles.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let key = format!("key-{}", i);
            cache
                .get_or_create::<u32, _, _>(
                    &key,
                    move |_ctx| async move {
                        factory_calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(Some(i))
                    },
                    None,
                    &cancel,
                )
                .await
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap().unwrap(), Some(i as u32));
    }
    assert_eq!(factory_calls.load(Ordering::SeqCst), 8);

    cache.shutdown().await;
}
