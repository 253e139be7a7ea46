//! Stream-to-query pipeline integration tests
//!
//! Events go in through the consumer group and come out through the query
//! service, all on in-process backends.

mod common;

use async_trait::async_trait;
use bi_realtime::aggregation::{aggregate_key, Event, LeadTemperature, WindowAggregator, WindowName, AGG_NAMESPACE};
use bi_realtime::cache::{CacheKey, MemorySharedCache, MultiTierCache, QueryType};
use bi_realtime::clock::ManualClock;
use bi_realtime::config::{AggregatorConfig, BiConfig, CacheConfig, ConsumerConfig};
use bi_realtime::query::{QueryService, ANALYTICS_NAMESPACE};
use bi_realtime::streams::{EventConsumer, EventHandler, EventProducer, MemoryStreams, StreamMessage};
use bi_realtime::tasks::BackgroundTasks;
use bi_realtime::{Backends, BiRealtimeService};
use chrono::Duration as ChronoDuration;
use common::{eventually, START};
use ehub_core::{EhubError, EhubService, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

const LEADS: &str = "bi:events:leads";

fn fast_consumer() -> ConsumerConfig {
    ConsumerConfig {
        block: Duration::from_millis(20),
        backoff_initial: Duration::from_millis(10),
        backoff_max: Duration::from_millis(50),
        lease_timeout: Duration::from_millis(50),
        reclaim_interval: Duration::from_millis(50),
        shutdown_grace: Duration::from_secs(1),
        ..ConsumerConfig::default()
    }
}

fn pinned_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(START.parse().unwrap()))
}

#[tokio::test]
async fn test_leads_flow_from_stream_to_query() {
    let streams = Arc::new(MemoryStreams::new());
    let backends = Backends {
        l2: Arc::new(MemorySharedCache::new()),
        streams: streams.clone(),
        clock: pinned_clock(),
    };
    let config = BiConfig {
        consumer: fast_consumer(),
        ..BiConfig::default()
    };
    let service = BiRealtimeService::new(config, backends);
    let shutdown = CancellationToken::new();
    assert_ok!(service.start_workers(&shutdown).await);

    let producer = EventProducer::new(streams.clone());
    for i in 0..100 {
        let temperature = if i % 5 == 0 { LeadTemperature::Hot } else { LeadTemperature::Cold };
        let event = Event::lead("loc1", temperature).with_id(format!("lead-{}", i));
        producer.publish(LEADS, &event).await.unwrap();
    }
    // the same event published twice is folded in once
    producer
        .publish(LEADS, &Event::lead("loc1", LeadTemperature::Hot).with_id("lead-0"))
        .await
        .unwrap();

    let state = service.state();
    assert!(eventually(|| state.aggregator.stats().duplicates == 1).await);
    assert!(eventually(|| streams.pending_count(LEADS, "bi_realtime") == 0).await);
    assert_eq!(state.aggregator.stats().events_ingested, 100);

    let snapshot = state.query.get_aggregate("5min", "loc1").await.unwrap().unwrap();
    assert_eq!(snapshot.value("total_interactions"), Some(100.0));
    assert_eq!(snapshot.value("hot_leads"), Some(20.0));
    assert_eq!(snapshot.value("conversion_rate"), Some(0.2));

    shutdown.cancel();
    service.shutdown().await.unwrap();
    assert!(!state.consumer.is_running());
}

/// Fails the first `failures` deliveries, then hands off to the aggregator
struct FlakyHandler {
    inner: WindowAggregator,
    failures: AtomicUsize,
}

#[async_trait]
impl EventHandler for FlakyHandler {
    async fn handle(&self, message: &StreamMessage) -> Result<()> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(EhubError::Compute("aggregator busy".into()));
        }
        self.inner.handle(message).await
    }
}

#[tokio::test]
async fn test_failed_delivery_is_redelivered_and_counted_once() {
    let streams = Arc::new(MemoryStreams::new());
    let cache = MultiTierCache::in_memory(&CacheConfig::default());
    let aggregator = WindowAggregator::new(AggregatorConfig::default(), cache, pinned_clock());
    let handler = Arc::new(FlakyHandler {
        inner: aggregator.clone(),
        failures: AtomicUsize::new(1),
    });
    let consumer = EventConsumer::new(
        ConsumerConfig {
            streams: vec![LEADS.to_string()],
            ..fast_consumer()
        },
        streams.clone(),
        handler,
        BackgroundTasks::new(),
    );
    let root = CancellationToken::new();
    consumer.start(&root).await.unwrap();

    EventProducer::new(streams.clone())
        .publish(LEADS, &Event::lead("loc1", LeadTemperature::Warm).with_id("retry-me"))
        .await
        .unwrap();

    assert!(eventually(|| aggregator.stats().events_ingested == 1).await);
    assert!(eventually(|| streams.pending_count(LEADS, "bi_realtime") == 0).await);

    let stats = consumer.stats();
    let leads = &stats.streams[LEADS];
    assert_eq!(leads.failed, 1);
    assert!(leads.reclaimed >= 1);
    assert_eq!(leads.dropped, 0);

    consumer.stop().await;
}

#[tokio::test]
async fn test_rematerialization_replaces_served_aggregate() {
    let clock = pinned_clock();
    let cache = MultiTierCache::in_memory(&CacheConfig::default());
    let aggregator = WindowAggregator::new(AggregatorConfig::default(), cache.clone(), clock.clone());
    let query = QueryService::new(cache.clone(), aggregator.clone());

    for _ in 0..3 {
        aggregator.ingest(&Event::lead("loc1", LeadTemperature::Hot));
    }
    aggregator.materialize_window(WindowName::FiveMinutes).await;
    let first = query.get_aggregate("5min", "loc1").await.unwrap().unwrap();
    assert_eq!(first.value("hot_leads"), Some(3.0));

    // next five-minute bucket
    clock.advance(ChronoDuration::minutes(6));
    aggregator.ingest(&Event::lead("loc1", LeadTemperature::Cold));

    // still served from cache until the next materialization
    let cached = query.get_aggregate("5min", "loc1").await.unwrap().unwrap();
    assert_eq!(cached.window_start, first.window_start);

    aggregator.materialize_window(WindowName::FiveMinutes).await;
    let fresh = query.get_aggregate("5min", "loc1").await.unwrap().unwrap();
    assert_eq!(fresh.value("total_interactions"), Some(1.0));
    assert_eq!(fresh.value("hot_leads"), None);
    assert!(fresh.window_start > first.window_start);

    let hour = query.get_aggregate("1hr", "loc1").await.unwrap().unwrap();
    assert_eq!(hour.value("total_interactions"), Some(4.0));
}

#[tokio::test]
async fn test_analytics_invalidation_leaves_aggregates() {
    let cache = MultiTierCache::in_memory(&CacheConfig::default());
    let aggregator = WindowAggregator::new(AggregatorConfig::default(), cache.clone(), pinned_clock());
    let query = QueryService::new(cache.clone(), aggregator.clone());

    aggregator.ingest(&Event::lead("loc1", LeadTemperature::Hot));
    aggregator.materialize_window(WindowName::FiveMinutes).await;
    query.get_realtime_metrics("loc1").await.unwrap();
    query.get_realtime_metrics("loc2").await.unwrap();

    assert!(cache.get(&realtime_key("loc1"), ANALYTICS_NAMESPACE).await.is_some());

    assert_eq!(cache.invalidate_namespace(ANALYTICS_NAMESPACE).await, 2);
    assert_eq!(cache.invalidate_namespace(ANALYTICS_NAMESPACE).await, 0);
    assert!(cache.get(&realtime_key("loc1"), ANALYTICS_NAMESPACE).await.is_none());
    assert!(cache.get(&realtime_key("loc2"), ANALYTICS_NAMESPACE).await.is_none());

    let key = aggregate_key(WindowName::FiveMinutes, "loc1");
    assert!(cache.get(&key, AGG_NAMESPACE).await.is_some());
}

#[tokio::test]
async fn test_analytics_invalidation_holds_across_l2_outage() {
    let l2 = Arc::new(MemorySharedCache::new());
    let cache = MultiTierCache::new(&CacheConfig::default(), l2.clone());
    let aggregator = WindowAggregator::new(AggregatorConfig::default(), cache.clone(), pinned_clock());
    let query = QueryService::new(cache.clone(), aggregator.clone());

    aggregator.ingest(&Event::lead("loc1", LeadTemperature::Hot));
    aggregator.materialize_window(WindowName::FiveMinutes).await;
    query.get_realtime_metrics("loc1").await.unwrap();

    l2.set_available(false);
    assert_eq!(cache.invalidate_namespace(ANALYTICS_NAMESPACE).await, 1);
    l2.set_available(true);

    assert!(cache.get(&realtime_key("loc1"), ANALYTICS_NAMESPACE).await.is_none());
    let key = aggregate_key(WindowName::FiveMinutes, "loc1");
    assert!(cache.get(&key, AGG_NAMESPACE).await.is_some());
}

fn realtime_key(location: &str) -> String {
    format!(
        "{}:{}",
        QueryType::RealTimeMetrics.as_str(),
        CacheKey::param_hash(&serde_json::json!({ "location_id": location }))
    )
}
