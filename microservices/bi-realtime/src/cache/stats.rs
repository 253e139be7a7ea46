//! Cache metrics and the analytics report built from them

use ehub_telemetry::{Counter, Histogram, HistogramSnapshot};
use serde::Serialize;

use super::breaker::CircuitState;

/// Rolling metrics updated on every get/set
pub struct CacheMetrics {
    pub l1_hits: Counter,
    pub l1_misses: Counter,
    pub l2_hits: Counter,
    pub l2_misses: Counter,
    pub l2_errors: Counter,
    /// L2 skipped because the breaker was open
    pub l2_short_circuits: Counter,
    pub sets: Counter,
    pub computations: Counter,
    pub compute_failures: Counter,
    pub refreshes: Counter,
    pub warmed: Counter,
    pub invalidated: Counter,
    pub l1_latency_us: Histogram,
    pub l2_latency_us: Histogram,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self {
            l1_hits: Counter::new("cache_l1_hits_total"),
            l1_misses: Counter::new("cache_l1_misses_total"),
            l2_hits: Counter::new("cache_l2_hits_total"),
            l2_misses: Counter::new("cache_l2_misses_total"),
            l2_errors: Counter::new("cache_l2_errors_total"),
            l2_short_circuits: Counter::new("cache_l2_short_circuits_total"),
            sets: Counter::new("cache_sets_total"),
            computations: Counter::new("cache_computations_total"),
            compute_failures: Counter::new("cache_compute_failures_total"),
            refreshes: Counter::new("cache_refreshes_total"),
            warmed: Counter::new("cache_warmed_total"),
            invalidated: Counter::new("cache_invalidated_total"),
            l1_latency_us: Histogram::with_capacity("cache_l1_latency_us", 1024),
            l2_latency_us: Histogram::with_capacity("cache_l2_latency_us", 1024),
        }
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TierStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub latency_us: HistogramSnapshot,
}

impl TierStats {
    fn new(hits: u64, misses: u64, latency_us: HistogramSnapshot) -> Self {
        Self {
            hits,
            misses,
            hit_rate: hit_rate(hits, misses),
            latency_us,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub backend: &'static str,
    pub l1: TierStats,
    pub l2: TierStats,
    pub overall_hit_rate: f64,
    pub l1_size: usize,
    pub l1_capacity: usize,
    pub l1_evictions: u64,
    pub l1_expirations: u64,
    pub l2_errors: u64,
    pub l2_short_circuits: u64,
    pub breaker_state: CircuitState,
    pub breaker_opened: u64,
    pub sets: u64,
    pub computations: u64,
    pub compute_failures: u64,
    pub single_flight_joins: u64,
    pub refreshes: u64,
    pub warmed: u64,
    pub invalidated: u64,
    pub hot_keys: usize,
}

pub(crate) struct StatsInputs {
    pub backend: &'static str,
    pub l1_size: usize,
    pub l1_capacity: usize,
    pub l1_evictions: u64,
    pub l1_expirations: u64,
    pub breaker_state: CircuitState,
    pub breaker_opened: u64,
    pub single_flight_joins: u64,
    pub hot_keys: usize,
}

impl CacheStats {
    pub(crate) fn build(metrics: &CacheMetrics, inputs: StatsInputs) -> Self {
        let l1_hits = metrics.l1_hits.get();
        let l2_hits = metrics.l2_hits.get();
        // every lookup ends as an L1 hit, an L2 hit or an L2 miss
        let total_misses = metrics.l2_misses.get();
        Self {
            backend: inputs.backend,
            l1: TierStats::new(l1_hits, metrics.l1_misses.get(), metrics.l1_latency_us.snapshot()),
            l2: TierStats::new(l2_hits, total_misses, metrics.l2_latency_us.snapshot()),
            overall_hit_rate: hit_rate(l1_hits + l2_hits, total_misses),
            l1_size: inputs.l1_size,
            l1_capacity: inputs.l1_capacity,
            l1_evictions: inputs.l1_evictions,
            l1_expirations: inputs.l1_expirations,
            l2_errors: metrics.l2_errors.get(),
            l2_short_circuits: metrics.l2_short_circuits.get(),
            breaker_state: inputs.breaker_state,
            breaker_opened: inputs.breaker_opened,
            sets: metrics.sets.get(),
            computations: metrics.computations.get(),
            compute_failures: metrics.compute_failures.get(),
            single_flight_joins: inputs.single_flight_joins,
            refreshes: metrics.refreshes.get(),
            warmed: metrics.warmed.get(),
            invalidated: metrics.invalidated.get(),
            hot_keys: inputs.hot_keys,
        }
    }
}

fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}
