//! Multi-tier cache integration tests

use bi_realtime::cache::{MemorySharedCache, MultiTierCache, QueryType, Timeframe};
use bi_realtime::config::CacheConfig;
use ehub_core::EhubError;
use futures_util::future::join_all;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_concurrent_misses_compute_once() {
    let cache = MultiTierCache::in_memory(&CacheConfig::default());
    let computations = Arc::new(AtomicUsize::new(0));

    let callers = (0..32).map(|_| {
        let cache = cache.clone();
        let computations = computations.clone();
        tokio::spawn(async move {
            cache
                .get_or_compute("revenue:loc1", "bi:analytics", Duration::from_secs(60), move || async move {
                    computations.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(json!({ "revenue": 1250.0 }))
                })
                .await
        })
    });
    let results = join_all(callers).await;

    assert_eq!(computations.load(Ordering::SeqCst), 1);
    for result in results {
        assert_eq!(result.unwrap().unwrap()["revenue"], 1250.0);
    }
}

#[tokio::test]
async fn test_failed_compute_reaches_all_waiters_then_retries() {
    let cache = MultiTierCache::in_memory(&CacheConfig::default());
    let attempts = Arc::new(AtomicUsize::new(0));

    let compute = |attempts: Arc<AtomicUsize>| {
        move || async move {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            if n == 0 {
                Err(EhubError::Compute("warehouse offline".into()))
            } else {
                Ok(Value::from(n))
            }
        }
    };

    let first = join_all((0..8).map(|_| {
        cache.get_or_compute("k", "ns", Duration::from_secs(60), compute(attempts.clone()))
    }))
    .await;
    assert!(first.iter().all(|r| r.is_err()));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    let second = cache
        .get_or_compute("k", "ns", Duration::from_secs(60), compute(attempts.clone()))
        .await
        .unwrap();
    assert_eq!(second, Value::from(1));
}

#[tokio::test]
async fn test_l2_is_shared_between_instances() {
    let l2 = Arc::new(MemorySharedCache::new());
    let config = CacheConfig::default();
    let writer = MultiTierCache::new(&config, l2.clone());
    let reader = MultiTierCache::new(&config, l2.clone());

    writer
        .set("5min:loc1", json!({ "hot_leads": 4 }), "agg", Duration::from_secs(300))
        .await;
    assert_eq!(reader.get("5min:loc1", "agg").await.unwrap()["hot_leads"], 4);

    // L2 outage: the reader keeps serving what it promoted into L1
    l2.set_available(false);
    assert!(reader.get("5min:loc1", "agg").await.is_some());
    assert!(reader.get("5min:loc2", "agg").await.is_none());

    l2.set_available(true);
    assert_eq!(writer.invalidate_namespace("agg").await, 1);
    assert!(writer.get("5min:loc1", "agg").await.is_none());
}

#[test]
fn test_every_query_ttl_is_bounded() {
    let config = CacheConfig::default();
    let cache = MultiTierCache::in_memory(&config);
    let timeframes = [
        Duration::from_secs(60),
        Duration::from_secs(3600),
        Duration::from_secs(30 * 24 * 3600),
    ];

    for query in QueryType::ALL {
        for span in timeframes {
            let ttl = cache.ttl_for(query, Timeframe::new(span), "any", "bi:analytics");
            assert!(
                ttl >= config.min_ttl && ttl <= config.max_ttl,
                "{} over {:?} gave {:?}",
                query.as_str(),
                span,
                ttl
            );
        }
    }
}
