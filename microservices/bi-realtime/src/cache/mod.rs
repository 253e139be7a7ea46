//! Multi-tier cache: in-process LRU (L1) in front of a shared store (L2).
//!
//! - Reads check L1, then L2, promoting L2 hits into L1 with their
//!   remaining lifetime.
//! - Writes go to both tiers independently. An L2 failure is logged and
//!   counted but never surfaces to the caller.
//! - `get_or_compute` coalesces concurrent misses per key so the compute
//!   function runs once.
//! - L2 sits behind a timeout and a circuit breaker; when it is unhealthy
//!   the cache keeps serving from L1 alone.

mod breaker;
mod key;
mod lru;
mod redis;
mod shared;
mod single_flight;
mod stats;
mod ttl;
mod warming;

pub use breaker::{CircuitBreaker, CircuitState};
pub use key::{full_key, namespace_prefix, CacheKey};
pub use lru::{L1Cache, L1Entry};
pub use redis::RedisSharedCache;
pub use shared::{MemorySharedCache, SharedCache};
pub use single_flight::SingleFlight;
pub use stats::{CacheMetrics, CacheStats, TierStats};
pub use ttl::{AccessTracker, QueryType, Timeframe, TtlPolicy, Volatility};
pub use warming::{CacheWarmer, WarmFn, WarmTtl};

use chrono::Utc;
use dashmap::DashMap;
use ehub_core::{LocationId, Result};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use stats::StatsInputs;

/// What L2 actually stores: the value plus its absolute lifetime, so a
/// promotion into L1 keeps the original expiry instead of restarting it.
#[derive(Debug, Serialize, Deserialize)]
struct L2Envelope {
    value: Value,
    created_at_ms: i64,
    expires_at_ms: i64,
}

struct CacheInner {
    l1: L1Cache,
    l2: Arc<dyn SharedCache>,
    breaker: CircuitBreaker,
    flights: SingleFlight,
    access: AccessTracker,
    policy: TtlPolicy,
    metrics: CacheMetrics,
    refresh_fraction: f64,
    /// Namespace prefixes whose L2 purge did not go through, keyed to the
    /// invalidation time. Retried before the next L2 access under the prefix.
    pending_purges: DashMap<String, i64>,
}

#[derive(Clone)]
pub struct MultiTierCache {
    inner: Arc<CacheInner>,
}

impl MultiTierCache {
    pub fn new(config: &CacheConfig, l2: Arc<dyn SharedCache>) -> Self {
        info!(
            l1_capacity = config.l1_capacity,
            backend = l2.backend(),
            "Multi-tier cache initialized"
        );
        Self {
            inner: Arc::new(CacheInner {
                l1: L1Cache::new(config.l1_capacity),
                l2,
                breaker: CircuitBreaker::new(
                    config.breaker_failure_threshold,
                    config.breaker_open_duration,
                ),
                flights: SingleFlight::new(),
                access: AccessTracker::from_config(config),
                policy: TtlPolicy::from_config(config),
                metrics: CacheMetrics::new(),
                refresh_fraction: config.refresh_fraction,
                pending_purges: DashMap::new(),
            }),
        }
    }

    /// Cache with an in-process L2, for single-instance deployments and tests
    pub fn in_memory(config: &CacheConfig) -> Self {
        Self::new(config, Arc::new(MemorySharedCache::new()))
    }

    /// Look up `key` in `namespace`. Absence is a normal result.
    pub async fn get(&self, key: &str, namespace: &str) -> Option<Value> {
        let full = full_key(namespace, key);
        self.lookup(&full).await
    }

    async fn lookup(&self, full: &str) -> Option<Value> {
        let inner = &self.inner;
        let now = Instant::now();
        inner.access.record(full, now);

        if let Some(entry) = inner.l1.get(full, now) {
            inner.metrics.l1_hits.inc();
            inner.metrics.l1_latency_us.record(micros(now.elapsed()));
            return Some(entry.value);
        }
        inner.metrics.l1_misses.inc();
        inner.metrics.l1_latency_us.record(micros(now.elapsed()));

        match self.l2_read(full).await {
            Some((value, remaining)) => {
                inner.metrics.l2_hits.inc();
                inner.l1.insert(full, value.clone(), remaining, Instant::now());
                debug!(key = %full, "Promoted L2 hit into L1");
                Some(value)
            }
            None => {
                inner.metrics.l2_misses.inc();
                None
            }
        }
    }

    /// Write to both tiers. Tier failures are independent and never raised.
    pub async fn set(&self, key: &str, value: Value, namespace: &str, ttl: Duration) {
        let full = full_key(namespace, key);
        self.store(&full, value, ttl).await;
    }

    async fn store(&self, full: &str, value: Value, ttl: Duration) {
        let inner = &self.inner;
        inner.metrics.sets.inc();

        let now_ms = Utc::now().timestamp_millis();
        let envelope = L2Envelope {
            value: value.clone(),
            created_at_ms: now_ms,
            expires_at_ms: now_ms + ttl.as_millis() as i64,
        };
        if let Some(evicted) = inner.l1.insert(full, value, ttl, Instant::now()) {
            debug!(key = %evicted, "Evicted least recently used L1 entry");
        }

        match serde_json::to_vec(&envelope) {
            Ok(bytes) => self.l2_write(full, bytes, ttl).await,
            Err(e) => warn!(key = %full, error = %e, "Failed to encode L2 entry"),
        }
    }

    pub async fn delete(&self, key: &str, namespace: &str) -> bool {
        let full = full_key(namespace, key);
        let in_l1 = self.inner.l1.remove(&full);
        let in_l2 = self
            .guarded_l2(|l2, k| async move { l2.delete(&k).await }, &full)
            .await
            .unwrap_or(false);
        in_l1 || in_l2
    }

    /// Stampede-safe read-through.
    ///
    /// Concurrent misses on the same key share one `compute` call. A failed
    /// computation reaches every waiter and leaves the key uncached.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        namespace: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<Value>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let full = full_key(namespace, key);
        if let Some(value) = self.lookup(&full).await {
            return Ok(value);
        }
        self.compute_through(full, ttl, compute, true).await
    }

    /// Recompute and store `key` unconditionally, still coalesced with any
    /// computation already in flight for it.
    pub async fn refresh<F, Fut>(
        &self,
        key: &str,
        namespace: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<Value>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.compute_through(full_key(namespace, key), ttl, compute, false)
            .await
    }

    /// Refresh-ahead read: a hit with less than the configured fraction of
    /// `ttl` left is returned as-is while a background recomputation runs.
    pub async fn get_with_refresh<F, Fut>(
        &self,
        key: &str,
        namespace: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<Value>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let full = full_key(namespace, key);
        let Some(value) = self.lookup(&full).await else {
            return self.compute_through(full, ttl, compute, true).await;
        };

        let remaining = self
            .inner
            .l1
            .peek(&full, Instant::now())
            .map(|entry| entry.remaining(Instant::now()))
            .unwrap_or_default();
        let fraction = remaining.as_secs_f64() / ttl.as_secs_f64().max(f64::EPSILON);

        if fraction < self.inner.refresh_fraction {
            self.inner.metrics.refreshes.inc();
            let cache = self.clone();
            tokio::spawn(async move {
                if let Err(e) = cache.compute_through(full.clone(), ttl, compute, false).await {
                    debug!(key = %full, error = %e, "Background refresh failed");
                }
            });
        }
        Ok(value)
    }

    async fn compute_through<F, Fut>(
        &self,
        full: String,
        ttl: Duration,
        compute: F,
        recheck: bool,
    ) -> Result<Value>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let cache = self.clone();
        let flight_key = full.clone();
        let (result, joined) = self
            .inner
            .flights
            .run(&flight_key, move || async move {
                // another flight may have filled the key since our miss
                if recheck {
                    if let Some(entry) = cache.inner.l1.peek(&full, Instant::now()) {
                        return Ok(entry.value);
                    }
                }
                cache.inner.metrics.computations.inc();
                match compute().await {
                    Ok(value) => {
                        cache.store(&full, value.clone(), ttl).await;
                        Ok(value)
                    }
                    Err(e) => {
                        cache.inner.metrics.compute_failures.inc();
                        warn!(key = %full, error = %e, "Cache computation failed");
                        Err(e)
                    }
                }
            })
            .await;
        if joined {
            debug!(key = %flight_key, "Joined in-flight computation");
        }
        result
    }

    pub async fn get_many(&self, keys: &[&str], namespace: &str) -> HashMap<String, Value> {
        let lookups = keys.iter().map(|key| async move {
            let value = self.get(key, namespace).await;
            (key.to_string(), value)
        });
        join_all(lookups)
            .await
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .collect()
    }

    pub async fn set_many(&self, items: Vec<(String, Value)>, namespace: &str, ttl: Duration) {
        let writes = items
            .into_iter()
            .map(|(key, value)| async move { self.set(&key, value, namespace, ttl).await });
        join_all(writes).await;
    }

    /// Remove every key under `namespace` from both tiers.
    ///
    /// If L2 cannot be purged now, the namespace is remembered and the purge
    /// is retried before any later L2 access under it. Until then L2 entries
    /// written before the invalidation read as misses.
    ///
    /// Returns the number of distinct keys removed.
    pub async fn invalidate_namespace(&self, namespace: &str) -> usize {
        let prefix = namespace_prefix(namespace);
        let invalidated_at_ms = Utc::now().timestamp_millis();
        let mut removed: HashSet<String> = self.inner.l1.remove_prefix(&prefix).into_iter().collect();

        match self
            .guarded_l2(|l2, p| async move { l2.delete_prefix(&p).await }, &prefix)
            .await
        {
            Some(keys) => {
                removed.extend(keys);
                self.inner.pending_purges.remove(&prefix);
            }
            None => {
                warn!(namespace = %namespace, "L2 purge failed, deferring until L2 is reachable");
                self.inner.pending_purges.insert(prefix.clone(), invalidated_at_ms);
            }
        }
        self.inner.access.forget_prefix(&prefix);
        self.inner.metrics.invalidated.add(removed.len() as u64);

        info!(namespace = %namespace, count = removed.len(), "Invalidated cache namespace");
        removed.len()
    }

    /// TTL for a query, shortened when `key` is currently hot
    pub fn ttl_for(&self, query: QueryType, timeframe: Timeframe, key: &str, namespace: &str) -> Duration {
        let hot = self
            .inner
            .access
            .is_hot(&full_key(namespace, key), Instant::now());
        self.inner.policy.ttl_for(query, timeframe, hot)
    }

    pub fn access_frequency(&self, key: &str, namespace: &str) -> u64 {
        self.inner
            .access
            .frequency(&full_key(namespace, key), Instant::now())
    }

    /// Hot keys in `namespace` that are missing from L1 or close to expiry.
    ///
    /// Returned without the namespace prefix.
    pub fn warm_candidates(&self, namespace: &str) -> Vec<String> {
        let prefix = namespace_prefix(namespace);
        let now = Instant::now();
        self.inner
            .access
            .hot_keys(now)
            .into_iter()
            .filter_map(|full| full.strip_prefix(&prefix).map(|k| (full.clone(), k.to_string())))
            .filter(|(full, _)| match self.inner.l1.peek(full, now) {
                Some(entry) => {
                    let fraction =
                        entry.remaining(now).as_secs_f64() / entry.ttl().as_secs_f64();
                    fraction < self.inner.refresh_fraction
                }
                None => true,
            })
            .map(|(_, key)| key)
            .collect()
    }

    pub fn purge_expired(&self) -> usize {
        self.inner.l1.purge_expired(Instant::now())
    }

    pub(crate) fn record_warmed(&self, count: usize) {
        self.inner.metrics.warmed.add(count as u64);
    }

    pub async fn ping_l2(&self) -> Result<()> {
        self.inner.l2.ping().await
    }

    pub fn l2_backend(&self) -> &'static str {
        self.inner.l2.backend()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = &self.inner;
        CacheStats::build(
            &inner.metrics,
            StatsInputs {
                backend: inner.l2.backend(),
                l1_size: inner.l1.len(),
                l1_capacity: inner.l1.capacity(),
                l1_evictions: inner.l1.evictions(),
                l1_expirations: inner.l1.expirations(),
                breaker_state: inner.breaker.state(),
                breaker_opened: inner.breaker.opened_total(),
                single_flight_joins: inner.flights.joins(),
                hot_keys: inner.access.hot_keys(Instant::now()).len(),
            },
        )
    }

    async fn l2_read(&self, full: &str) -> Option<(Value, Duration)> {
        let outstanding = self.settle_purges(full).await;
        let started = Instant::now();
        let bytes = self
            .guarded_l2(|l2, k| async move { l2.get(&k).await }, full)
            .await??;
        self.inner.metrics.l2_latency_us.record(micros(started.elapsed()));

        let envelope: L2Envelope = match serde_json::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(key = %full, error = %e, "Discarding undecodable L2 entry");
                return None;
            }
        };
        if outstanding.is_some_and(|invalidated_at_ms| envelope.created_at_ms <= invalidated_at_ms) {
            debug!(key = %full, "Ignoring L2 entry from an invalidated namespace");
            return None;
        }
        let remaining_ms = envelope.expires_at_ms - Utc::now().timestamp_millis();
        if remaining_ms <= 0 {
            return None;
        }
        Some((envelope.value, Duration::from_millis(remaining_ms as u64)))
    }

    async fn l2_write(&self, full: &str, bytes: Vec<u8>, ttl: Duration) {
        self.settle_purges(full).await;
        let started = Instant::now();
        let written = self
            .guarded_l2(
                move |l2, k| async move { l2.set(&k, bytes, ttl).await },
                full,
            )
            .await;
        if written.is_some() {
            self.inner.metrics.l2_latency_us.record(micros(started.elapsed()));
        }
    }

    /// Retry deferred namespace purges covering `full`. Returns the latest
    /// invalidation time still outstanding for it.
    async fn settle_purges(&self, full: &str) -> Option<i64> {
        let pending_purges = &self.inner.pending_purges;
        if pending_purges.is_empty() {
            return None;
        }
        let covering: Vec<(String, i64)> = pending_purges
            .iter()
            .filter(|entry| full.starts_with(entry.key().as_str()))
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();

        let mut outstanding = None;
        for (prefix, invalidated_at_ms) in covering {
            match self
                .guarded_l2(|l2, p| async move { l2.delete_prefix(&p).await }, &prefix)
                .await
            {
                Some(keys) => {
                    pending_purges.remove_if(&prefix, |_, at| *at == invalidated_at_ms);
                    info!(prefix = %prefix, count = keys.len(), "Completed deferred L2 purge");
                }
                None => outstanding = outstanding.max(Some(invalidated_at_ms)),
            }
        }
        outstanding
    }

    /// Run one L2 operation through the breaker. `None` means the call was
    /// skipped or failed; either way the caller falls back to L1 only.
    async fn guarded_l2<T, F, Fut>(&self, op: F, arg: &str) -> Option<T>
    where
        F: FnOnce(Arc<dyn SharedCache>, String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let inner = &self.inner;
        if !inner.breaker.allow_request() {
            inner.metrics.l2_short_circuits.inc();
            return None;
        }
        match op(Arc::clone(&inner.l2), arg.to_string()).await {
            Ok(value) => {
                inner.breaker.record_success();
                Some(value)
            }
            Err(e) => {
                inner.breaker.record_failure();
                inner.metrics.l2_errors.inc();
                warn!(key = %arg, error = %e, backend = inner.l2.backend(), "L2 call failed, using L1 only");
                None
            }
        }
    }
}

fn micros(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1_000_000.0
}

/// Tenant-scoped view: every namespace is prefixed with `loc:{location_id}`.
#[derive(Clone)]
pub struct LocationScopedCache {
    cache: MultiTierCache,
    location: LocationId,
}

impl LocationScopedCache {
    pub fn new(cache: MultiTierCache, location: LocationId) -> Self {
        Self { cache, location }
    }

    pub fn location(&self) -> &LocationId {
        &self.location
    }

    fn scoped(&self, namespace: &str) -> String {
        format!("loc:{}:{}", self.location, namespace)
    }

    pub async fn get(&self, key: &str, namespace: &str) -> Option<Value> {
        self.cache.get(key, &self.scoped(namespace)).await
    }

    pub async fn set(&self, key: &str, value: Value, namespace: &str, ttl: Duration) {
        self.cache.set(key, value, &self.scoped(namespace), ttl).await
    }

    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        namespace: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<Value>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.cache
            .get_or_compute(key, &self.scoped(namespace), ttl, compute)
            .await
    }

    pub async fn invalidate_namespace(&self, namespace: &str) -> usize {
        self.cache.invalidate_namespace(&self.scoped(namespace)).await
    }

    /// Drop everything cached for this location
    pub async fn invalidate_all(&self) -> usize {
        self.cache
            .invalidate_namespace(&format!("loc:{}", self.location))
            .await
    }
}
