//! BI realtime configuration

use ehub_core::{env_list, env_or, Result, ServiceConfig};
use std::time::Duration;
use uuid::Uuid;

/// Default stream names, one per event family.
pub const DEFAULT_STREAMS: &[&str] = &[
    "bi:events:leads",
    "bi:events:commissions",
    "bi:events:bots",
    "bi:events:health",
];

#[derive(Debug, Clone)]
pub struct BiConfig {
    pub service: ServiceConfig,
    pub cache: CacheConfig,
    pub aggregator: AggregatorConfig,
    pub consumer: ConsumerConfig,
    pub hub: HubConfig,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub l1_capacity: usize,
    pub min_ttl: Duration,
    pub max_ttl: Duration,
    /// Accesses per tracking interval above which a key counts as hot
    pub high_frequency_threshold: u64,
    pub access_interval: Duration,
    pub max_tracked_keys: usize,
    /// Remaining-TTL fraction under which a hit triggers refresh-ahead
    pub refresh_fraction: f64,
    pub warm_interval: Duration,
    pub l2_timeout: Duration,
    pub breaker_failure_threshold: u32,
    pub breaker_open_duration: Duration,
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Materialization cadence for the 5min and 1hr windows
    pub fast_interval: Duration,
    /// Materialization cadence for the 24hr window
    pub slow_interval: Duration,
    pub dedup_ttl: Duration,
    pub dedup_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub streams: Vec<String>,
    pub group: String,
    pub consumer_name: String,
    pub batch_size: usize,
    pub block: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Idle time after which another consumer may claim a pending entry
    pub lease_timeout: Duration,
    pub reclaim_interval: Duration,
    /// Deliveries after which a failing entry is acknowledged and dropped
    pub max_deliveries: u64,
    pub call_timeout: Duration,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub idle_timeout: Duration,
    pub monitor_interval: Duration,
    pub metrics_interval: Duration,
    pub send_timeout: Duration,
    pub limits: ThrottleLimits,
    pub throttle_window: Duration,
    pub degrade_error_rate: f64,
    pub degrade_quality: f64,
    /// Connections under this quality with an error rate above
    /// `degrade_error_rate` are evicted by the monitor
    pub evict_quality: f64,
    pub max_consecutive_failures: u32,
    pub outcome_window: usize,
    pub max_pending_acks: usize,
}

/// Messages per throttle window, per priority class
#[derive(Debug, Clone, Copy)]
pub struct ThrottleLimits {
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl Default for ThrottleLimits {
    fn default() -> Self {
        Self {
            critical: 100,
            high: 50,
            normal: 30,
            low: 10,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: 1000,
            min_ttl: Duration::from_secs(60),
            max_ttl: Duration::from_secs(7200),
            high_frequency_threshold: 10,
            access_interval: Duration::from_secs(60),
            max_tracked_keys: 10_000,
            refresh_fraction: 0.2,
            warm_interval: Duration::from_secs(30),
            l2_timeout: Duration::from_millis(2000),
            breaker_failure_threshold: 5,
            breaker_open_duration: Duration::from_secs(10),
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            fast_interval: Duration::from_secs(60),
            slow_interval: Duration::from_secs(300),
            dedup_ttl: Duration::from_secs(600),
            dedup_capacity: 100_000,
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            streams: DEFAULT_STREAMS.iter().map(|s| s.to_string()).collect(),
            group: "bi_realtime".to_string(),
            consumer_name: default_consumer_name(),
            batch_size: 10,
            block: Duration::from_millis(1000),
            backoff_initial: Duration::from_secs(5),
            backoff_max: Duration::from_secs(60),
            lease_timeout: Duration::from_secs(60),
            reclaim_interval: Duration::from_secs(30),
            max_deliveries: 3,
            call_timeout: Duration::from_millis(2000),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            monitor_interval: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(30),
            send_timeout: Duration::from_secs(5),
            limits: ThrottleLimits::default(),
            throttle_window: Duration::from_secs(60),
            degrade_error_rate: 0.10,
            degrade_quality: 0.5,
            evict_quality: 0.2,
            max_consecutive_failures: 3,
            outcome_window: 20,
            max_pending_acks: 256,
        }
    }
}

fn default_consumer_name() -> String {
    format!("bi-{}", &Uuid::new_v4().simple().to_string()[..8])
}

fn secs(name: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_secs(env_or(name, default)?))
}

fn millis(name: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_millis(env_or(name, default)?))
}

impl BiConfig {
    pub fn from_env() -> Result<Self> {
        let mut service = ServiceConfig::from_env()?;
        if service.service_name == "unknown" {
            service.service_name = "bi-realtime".to_string();
        }
        let call_timeout = millis("EXTERNAL_CALL_TIMEOUT_MS", 2000)?;
        let shutdown_grace = secs("SHUTDOWN_GRACE_SECS", 10)?;

        let cache = CacheConfig {
            l1_capacity: env_or("L1_CAPACITY", 1000)?,
            min_ttl: secs("CACHE_MIN_TTL_SECS", 60)?,
            max_ttl: secs("CACHE_MAX_TTL_SECS", 7200)?,
            high_frequency_threshold: env_or("HIGH_FREQUENCY_THRESHOLD", 10)?,
            l2_timeout: call_timeout,
            ..CacheConfig::default()
        };

        let aggregator = AggregatorConfig {
            dedup_ttl: secs("DEDUP_TTL_SECS", 600)?,
            dedup_capacity: env_or("DEDUP_CAPACITY", 100_000)?,
            ..AggregatorConfig::default()
        };

        let consumer = ConsumerConfig {
            streams: env_list("BI_STREAMS", DEFAULT_STREAMS),
            group: std::env::var("CONSUMER_GROUP").unwrap_or_else(|_| "bi_realtime".to_string()),
            consumer_name: std::env::var("CONSUMER_NAME").unwrap_or_else(|_| default_consumer_name()),
            batch_size: env_or("STREAM_BATCH_SIZE", 10)?,
            block: millis("STREAM_BLOCK_MS", 1000)?,
            backoff_initial: secs("STREAM_BACKOFF_SECS", 5)?,
            backoff_max: secs("STREAM_BACKOFF_MAX_SECS", 60)?,
            call_timeout,
            shutdown_grace,
            ..ConsumerConfig::default()
        };

        let hub = HubConfig {
            idle_timeout: secs("CONNECTION_IDLE_SECS", 300)?,
            metrics_interval: secs("METRICS_REPORT_SECS", 30)?,
            ..HubConfig::default()
        };

        Ok(Self {
            service,
            cache,
            aggregator,
            consumer,
            hub,
            shutdown_grace,
        })
    }
}

impl Default for BiConfig {
    fn default() -> Self {
        let mut service = ServiceConfig::default();
        service.service_name = "bi-realtime".to_string();
        Self {
            service,
            cache: CacheConfig::default(),
            aggregator: AggregatorConfig::default(),
            consumer: ConsumerConfig::default(),
            hub: HubConfig::default(),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_limits() {
        let config = BiConfig::default();
        assert_eq!(config.cache.min_ttl, Duration::from_secs(60));
        assert_eq!(config.cache.max_ttl, Duration::from_secs(7200));
        assert_eq!(config.consumer.batch_size, 10);
        assert_eq!(config.hub.limits.normal, 30);
        assert_eq!(config.consumer.streams.len(), 4);
    }

    #[test]
    fn test_consumer_name_is_unique_per_instance() {
        assert_ne!(default_consumer_name(), default_consumer_name());
        assert!(default_consumer_name().starts_with("bi-"));
    }
}
