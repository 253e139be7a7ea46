//! Read side for dashboards: cached aggregates with on-demand fallback

use chrono::Utc;
use ehub_core::EhubError;
use futures_util::FutureExt;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::aggregation::{aggregate_key, aggregate_ttl, AggregateSnapshot, EntityKind, WindowAggregator, WindowName, AGG_NAMESPACE};
use crate::cache::{CacheKey, MultiTierCache, QueryType, Timeframe, WarmFn, WarmTtl};
use crate::error::{Error, Result};

/// Namespace for composed analytics responses
pub const ANALYTICS_NAMESPACE: &str = "bi:analytics";

#[derive(Clone)]
pub struct QueryService {
    cache: MultiTierCache,
    aggregator: WindowAggregator,
}

impl QueryService {
    pub fn new(cache: MultiTierCache, aggregator: WindowAggregator) -> Self {
        Self { cache, aggregator }
    }

    /// Materialized aggregate for one entity, or `None` if the entity has
    /// never been seen. A cache miss snapshots the live window and caches it.
    pub async fn get_aggregate(&self, window: &str, entity_key: &str) -> Result<Option<AggregateSnapshot>> {
        let window: WindowName = window
            .parse()
            .map_err(|_| Error::UnknownWindow(window.to_string()))?;
        if entity_key.trim().is_empty() {
            return Err(Error::InvalidRequest("entity key must not be empty".into()));
        }

        let aggregator = self.aggregator.clone();
        let entity = entity_key.to_string();
        let result = self
            .cache
            .get_or_compute(
                &aggregate_key(window, entity_key),
                AGG_NAMESPACE,
                window.std_duration(),
                move || async move {
                    debug!(window = %window, entity = %entity, "Aggregate not cached, snapshotting");
                    aggregator
                        .snapshot_entity(window, &entity)
                        .map(|s| s.to_json())
                        .ok_or_else(|| EhubError::NotFound(format!("aggregate {}:{}", window, entity)))
                },
            )
            .await;

        match result {
            Ok(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| Error::Core(e.into())),
            Err(EhubError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Current metrics for a location across all windows, with its bots
    /// broken out. Cached under a short, volatility-driven TTL.
    pub async fn get_realtime_metrics(&self, location_id: &str) -> Result<Value> {
        let location = location_id.trim();
        if location.is_empty() {
            return Err(Error::InvalidRequest("location id must not be empty".into()));
        }

        let key = format!(
            "{}:{}",
            QueryType::RealTimeMetrics.as_str(),
            CacheKey::param_hash(&json!({ "location_id": location }))
        );
        let ttl = self.cache.ttl_for(
            QueryType::RealTimeMetrics,
            Timeframe::new(Duration::from_secs(3600)),
            &key,
            ANALYTICS_NAMESPACE,
        );
        let aggregator = self.aggregator.clone();
        let location = location.to_string();
        let value = self
            .cache
            .get_or_compute(&key, ANALYTICS_NAMESPACE, ttl, move || async move {
                Ok(compose_realtime(&aggregator, &location))
            })
            .await?;
        Ok(value)
    }

    /// Warmed aggregates keep the lifetime of their own window
    pub fn aggregate_warm_ttl(&self) -> WarmTtl {
        Arc::new(|key: &str| aggregate_ttl(key).unwrap_or_else(|| WindowName::FiveMinutes.std_duration()))
    }

    /// Recomputes `{window}:{entity}` keys for the cache warmer
    pub fn aggregate_warm_fn(&self) -> WarmFn {
        let aggregator = self.aggregator.clone();
        Arc::new(move |key: String| {
            let aggregator = aggregator.clone();
            async move {
                let (window, entity) = key
                    .split_once(':')
                    .ok_or_else(|| EhubError::Validation(format!("malformed aggregate key {}", key)))?;
                let window: WindowName = window.parse().map_err(EhubError::Validation)?;
                aggregator
                    .snapshot_entity(window, entity)
                    .map(|s| s.to_json())
                    .ok_or_else(|| EhubError::NotFound(format!("aggregate {}", key)))
            }
            .boxed()
        })
    }
}

fn compose_realtime(aggregator: &WindowAggregator, location: &str) -> Value {
    let mut windows = Map::new();
    let mut bots = Map::new();

    for window in WindowName::ALL {
        windows.insert(
            window.as_str().to_string(),
            aggregator
                .snapshot_entity(window, location)
                .map(|s| s.to_json())
                .unwrap_or(Value::Null),
        );
    }

    for entity in aggregator.entities_for_location(location) {
        let Some(snapshot) = aggregator.snapshot_entity(WindowName::FiveMinutes, &entity) else {
            continue;
        };
        if snapshot.entity_kind == EntityKind::Bot {
            bots.insert(entity, snapshot.to_json());
        }
    }

    json!({
        "location_id": location,
        "generated_at": Utc::now(),
        "windows": windows,
        "bots": bots,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{Event, LeadTemperature};
    use crate::clock::SystemClock;
    use crate::config::{AggregatorConfig, CacheConfig};

    fn service() -> (QueryService, WindowAggregator, MultiTierCache) {
        let cache = MultiTierCache::in_memory(&CacheConfig::default());
        let aggregator = WindowAggregator::new(AggregatorConfig::default(), cache.clone(), Arc::new(SystemClock));
        (QueryService::new(cache.clone(), aggregator.clone()), aggregator, cache)
    }

    #[tokio::test]
    async fn test_unknown_window_is_rejected() {
        let (query, _, _) = service();
        assert!(matches!(
            query.get_aggregate("7d", "loc1").await,
            Err(Error::UnknownWindow(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_entity_is_absent_and_not_cached() {
        let (query, aggregator, cache) = service();
        assert!(query.get_aggregate("5min", "loc1").await.unwrap().is_none());

        aggregator.ingest(&Event::lead("loc1", LeadTemperature::Warm));
        let snapshot = query.get_aggregate("5min", "loc1").await.unwrap().unwrap();
        assert_eq!(snapshot.value("warm_leads"), Some(1.0));
        assert!(cache.get("5min:loc1", AGG_NAMESPACE).await.is_some());
    }

    #[tokio::test]
    async fn test_realtime_metrics_shape() {
        let (query, aggregator, _) = service();
        aggregator.ingest(&Event::lead("loc1", LeadTemperature::Hot));
        let metrics = query.get_realtime_metrics("loc1").await.unwrap();
        assert_eq!(metrics["location_id"], "loc1");
        assert_eq!(metrics["windows"]["5min"]["counters"]["hot_leads"], 1.0);
        assert!(metrics["bots"].as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_warm_fn_recomputes_aggregate() {
        let (query, aggregator, _) = service();
        aggregator.ingest(&Event::lead("loc1", LeadTemperature::Hot));
        let warm = query.aggregate_warm_fn();
        let value = warm("1hr:loc1".to_string()).await.unwrap();
        assert_eq!(value["window"], "1hr");
        assert!(warm("bogus".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_warmed_aggregates_keep_window_ttl() {
        let (query, _, _) = service();
        let ttl = query.aggregate_warm_ttl();
        assert_eq!(ttl("5min:loc1"), Duration::from_secs(300));
        assert_eq!(ttl("1hr:loc1"), Duration::from_secs(3600));
        assert_eq!(ttl("24hr:inbound:loc1"), Duration::from_secs(86400));
        assert_eq!(ttl("bogus"), Duration::from_secs(300));
    }
}
