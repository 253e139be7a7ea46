//! Predictive cache warming
//!
//! Namespaces register a compute function. Each cycle recomputes the keys in
//! those namespaces that are accessed often and are missing or about to
//! expire, so hot dashboards rarely see a miss.

use ehub_core::Result;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::MultiTierCache;

/// Recomputes the value for a key (namespace prefix already stripped)
pub type WarmFn = Arc<dyn Fn(String) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// TTL to store a warmed key under, chosen per key
pub type WarmTtl = Arc<dyn Fn(&str) -> Duration + Send + Sync>;

struct WarmTarget {
    ttl: WarmTtl,
    compute: WarmFn,
}

#[derive(Clone)]
pub struct CacheWarmer {
    cache: MultiTierCache,
    targets: Arc<RwLock<HashMap<String, WarmTarget>>>,
    interval: Duration,
}

impl CacheWarmer {
    pub fn new(cache: MultiTierCache, interval: Duration) -> Self {
        Self {
            cache,
            targets: Arc::new(RwLock::new(HashMap::new())),
            interval,
        }
    }

    pub fn register(&self, namespace: &str, ttl: WarmTtl, compute: WarmFn) {
        self.targets
            .write()
            .insert(namespace.to_string(), WarmTarget { ttl, compute });
        debug!(namespace = %namespace, "Registered warm target");
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.targets.read().keys().cloned().collect()
    }

    /// Warm every candidate once. Returns how many keys were recomputed.
    pub async fn warm_cycle(&self) -> usize {
        let plan: Vec<(String, String, Duration, WarmFn)> = {
            let targets = self.targets.read();
            targets
                .iter()
                .flat_map(|(ns, target)| {
                    self.cache
                        .warm_candidates(ns)
                        .into_iter()
                        .map(|key| {
                            let ttl = (target.ttl)(key.as_str());
                            (ns.clone(), key, ttl, target.compute.clone())
                        })
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        let mut warmed = 0;
        for (namespace, key, ttl, compute) in plan {
            let owned = key.clone();
            match self
                .cache
                .refresh(&key, &namespace, ttl, move || compute(owned))
                .await
            {
                Ok(_) => warmed += 1,
                Err(e) => warn!(namespace = %namespace, key = %key, error = %e, "Warm computation failed"),
            }
        }

        if warmed > 0 {
            self.cache.record_warmed(warmed);
            info!(warmed, "Cache warm cycle complete");
        }
        warmed
    }

    /// Warm on a fixed interval until `cancel` fires. Expired L1 entries are
    /// purged on the same tick.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Cache warmer stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let purged = self.cache.purge_expired();
                    if purged > 0 {
                        debug!(purged, "Purged expired L1 entries");
                    }
                    self.warm_cycle().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use futures_util::FutureExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_warms_only_hot_keys() {
        let cache = MultiTierCache::in_memory(&CacheConfig {
            high_frequency_threshold: 3,
            ..CacheConfig::default()
        });
        let warmer = CacheWarmer::new(cache.clone(), Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        warmer.register(
            "bi:analytics",
            Arc::new(|_: &str| Duration::from_secs(300)),
            Arc::new(move |key| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(json!({ "key": key })) }.boxed()
            }),
        );

        for _ in 0..4 {
            cache.get("dashboard_kpis", "bi:analytics").await;
        }
        cache.get("rarely_used", "bi:analytics").await;

        assert_eq!(warmer.warm_cycle().await, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            cache.get("dashboard_kpis", "bi:analytics").await,
            Some(json!({ "key": "dashboard_kpis" }))
        );

        // freshly warmed entries are skipped next cycle
        assert_eq!(warmer.warm_cycle().await, 0);
        assert_eq!(cache.stats().warmed, 1);
    }
}
