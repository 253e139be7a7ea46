//! TTL policy: volatility class, access frequency and query timeframe

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::config::CacheConfig;

/// How quickly the underlying data goes stale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Volatility {
    RealTime,
    High,
    Medium,
    Low,
    Historical,
}

impl Volatility {
    pub fn base_ttl(&self) -> Duration {
        Duration::from_secs(match self {
            Self::RealTime => 30,
            Self::High => 180,
            Self::Medium => 900,
            Self::Low => 3600,
            Self::Historical => 14_400,
        })
    }
}

/// Logical query families served from the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    DashboardKpis,
    RevenueIntelligence,
    BotPerformance,
    RealTimeMetrics,
    PredictiveInsights,
    AnomalyDetection,
    Aggregate,
    HistoricalTrends,
}

impl QueryType {
    pub const ALL: [QueryType; 8] = [
        Self::DashboardKpis,
        Self::RevenueIntelligence,
        Self::BotPerformance,
        Self::RealTimeMetrics,
        Self::PredictiveInsights,
        Self::AnomalyDetection,
        Self::Aggregate,
        Self::HistoricalTrends,
    ];

    pub fn volatility(&self) -> Volatility {
        match self {
            Self::RealTimeMetrics => Volatility::RealTime,
            Self::DashboardKpis | Self::BotPerformance | Self::AnomalyDetection => {
                Volatility::High
            }
            Self::RevenueIntelligence | Self::Aggregate => Volatility::Medium,
            Self::PredictiveInsights => Volatility::Low,
            Self::HistoricalTrends => Volatility::Historical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DashboardKpis => "dashboard_kpis",
            Self::RevenueIntelligence => "revenue_intelligence",
            Self::BotPerformance => "bot_performance",
            Self::RealTimeMetrics => "real_time_metrics",
            Self::PredictiveInsights => "predictive_insights",
            Self::AnomalyDetection => "anomaly_detection",
            Self::Aggregate => "aggregate",
            Self::HistoricalTrends => "historical_trends",
        }
    }
}

impl FromStr for QueryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| format!("unknown query type '{}'", s))
    }
}

/// Query lookback, written as `<n><unit>` with unit `m`, `h` or `d` (e.g. `24h`, `7d`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeframe(Duration);

impl Timeframe {
    /// Lookbacks of a week or more double the TTL
    pub const LONG: Duration = Duration::from_secs(7 * 24 * 3600);

    pub fn new(span: Duration) -> Self {
        Self(span)
    }

    pub fn span(&self) -> Duration {
        self.0
    }

    pub fn is_long(&self) -> bool {
        self.0 >= Self::LONG
    }
}

impl Default for Timeframe {
    fn default() -> Self {
        Self(Duration::from_secs(24 * 3600))
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let unit = s.chars().last().ok_or_else(|| "empty timeframe".to_string())?;
        let count: u64 = s[..s.len() - unit.len_utf8()]
            .parse()
            .map_err(|_| format!("invalid timeframe '{}'", s))?;
        let secs = match unit {
            'm' => 60,
            'h' => 3600,
            'd' => 86_400,
            _ => return Err(format!("invalid timeframe unit in '{}'", s)),
        };
        Ok(Self(Duration::from_secs(count * secs)))
    }
}

/// Computes TTLs: halve for hot keys, double for long lookbacks, then clamp.
#[derive(Debug, Clone, Copy)]
pub struct TtlPolicy {
    pub min: Duration,
    pub max: Duration,
}

impl TtlPolicy {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.min_ttl, config.max_ttl)
    }

    pub fn ttl_for(&self, query: QueryType, timeframe: Timeframe, hot: bool) -> Duration {
        let mut ttl = query.volatility().base_ttl();
        if hot {
            ttl /= 2;
        }
        if timeframe.is_long() {
            ttl *= 2;
        }
        ttl.clamp(self.min, self.max)
    }
}

#[derive(Debug, Clone, Copy)]
struct AccessWindow {
    bucket_start: Instant,
    current: u64,
    previous: u64,
}

impl AccessWindow {
    fn roll(&mut self, now: Instant, interval: Duration) {
        let elapsed = now.saturating_duration_since(self.bucket_start);
        if elapsed >= interval * 2 {
            self.previous = 0;
            self.current = 0;
            self.bucket_start = now;
        } else if elapsed >= interval {
            self.previous = self.current;
            self.current = 0;
            self.bucket_start += interval;
        }
    }

    /// Weighted two-bucket estimate of accesses in the trailing interval
    fn estimate(&self, now: Instant, interval: Duration) -> u64 {
        let into = now.saturating_duration_since(self.bucket_start).as_secs_f64();
        let weight = (1.0 - into / interval.as_secs_f64()).clamp(0.0, 1.0);
        self.current + (self.previous as f64 * weight).round() as u64
    }
}

/// Bounded per-key access frequency tracker.
///
/// Once `max_keys` are tracked, stale keys are pruned; if none are stale new
/// keys are simply not tracked until room frees up.
pub struct AccessTracker {
    windows: DashMap<String, AccessWindow>,
    interval: Duration,
    threshold: u64,
    max_keys: usize,
}

impl AccessTracker {
    pub fn new(interval: Duration, threshold: u64, max_keys: usize) -> Self {
        Self {
            windows: DashMap::new(),
            interval: interval.max(Duration::from_millis(1)),
            threshold,
            max_keys: max_keys.max(1),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(
            config.access_interval,
            config.high_frequency_threshold,
            config.max_tracked_keys,
        )
    }

    /// Record one access, returning the trailing estimate including it.
    pub fn record(&self, key: &str, now: Instant) -> u64 {
        if let Some(mut window) = self.windows.get_mut(key) {
            window.roll(now, self.interval);
            window.current += 1;
            return window.estimate(now, self.interval);
        }

        if self.windows.len() >= self.max_keys {
            self.prune(now);
            if self.windows.len() >= self.max_keys {
                return 1;
            }
        }

        let mut window = self.windows.entry(key.to_string()).or_insert(AccessWindow {
            bucket_start: now,
            current: 0,
            previous: 0,
        });
        window.roll(now, self.interval);
        window.current += 1;
        window.estimate(now, self.interval)
    }

    pub fn frequency(&self, key: &str, now: Instant) -> u64 {
        self.windows
            .get(key)
            .map(|w| {
                let mut w = *w;
                w.roll(now, self.interval);
                w.estimate(now, self.interval)
            })
            .unwrap_or(0)
    }

    pub fn is_hot(&self, key: &str, now: Instant) -> bool {
        self.frequency(key, now) > self.threshold
    }

    /// Keys currently above the high-frequency threshold
    pub fn hot_keys(&self, now: Instant) -> Vec<String> {
        self.windows
            .iter()
            .filter(|e| {
                let mut w = *e.value();
                w.roll(now, self.interval);
                w.estimate(now, self.interval) > self.threshold
            })
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn forget_prefix(&self, prefix: &str) {
        self.windows.retain(|k, _| !k.starts_with(prefix));
    }

    pub fn tracked(&self) -> usize {
        self.windows.len()
    }

    fn prune(&self, now: Instant) {
        let horizon = self.interval * 2;
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.bucket_start) < horizon);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> TtlPolicy {
        TtlPolicy::new(Duration::from_secs(60), Duration::from_secs(7200))
    }

    #[test]
    fn test_ttl_always_within_bounds() {
        let policy = policy();
        for query in QueryType::ALL {
            for tf in ["5m", "1h", "24h", "7d", "90d"] {
                let tf: Timeframe = tf.parse().unwrap();
                for hot in [false, true] {
                    let ttl = policy.ttl_for(query, tf, hot);
                    assert!(ttl >= Duration::from_secs(60), "{:?} {:?}", query, tf);
                    assert!(ttl <= Duration::from_secs(7200), "{:?} {:?}", query, tf);
                }
            }
        }
    }

    #[test]
    fn test_hot_keys_get_at_most_half_base() {
        let policy = policy();
        let tf = Timeframe::default();
        for query in QueryType::ALL {
            let base = query.volatility().base_ttl();
            // the floor wins when half the base is under it
            if base / 2 < policy.min {
                continue;
            }
            let hot = policy.ttl_for(query, tf, true);
            assert!(hot <= base / 2, "{:?}: {:?} > {:?}", query, hot, base / 2);
        }
    }

    #[test]
    fn test_long_timeframe_doubles() {
        let policy = policy();
        let short = policy.ttl_for(QueryType::RevenueIntelligence, "24h".parse().unwrap(), false);
        let long = policy.ttl_for(QueryType::RevenueIntelligence, "30d".parse().unwrap(), false);
        assert_eq!(long, short * 2);
    }

    #[test]
    fn test_timeframe_parse() {
        assert_eq!("15m".parse::<Timeframe>().unwrap().span(), Duration::from_secs(900));
        assert!("7d".parse::<Timeframe>().unwrap().is_long());
        assert!("x".parse::<Timeframe>().is_err());
        assert!("10y".parse::<Timeframe>().is_err());
        assert_eq!("aggregate".parse::<QueryType>().unwrap(), QueryType::Aggregate);
    }

    #[test]
    fn test_access_tracker_threshold() {
        let tracker = AccessTracker::new(Duration::from_secs(60), 10, 100);
        let now = Instant::now();
        for _ in 0..10 {
            tracker.record("k", now);
        }
        assert!(!tracker.is_hot("k", now));
        tracker.record("k", now);
        assert!(tracker.is_hot("k", now));
        assert_eq!(tracker.hot_keys(now), vec!["k".to_string()]);

        // two full intervals later the history is gone
        assert!(!tracker.is_hot("k", now + Duration::from_secs(121)));
    }

    #[test]
    fn test_access_tracker_is_bounded() {
        let tracker = AccessTracker::new(Duration::from_secs(60), 10, 4);
        let now = Instant::now();
        for i in 0..10 {
            tracker.record(&format!("k{}", i), now);
        }
        assert_eq!(tracker.tracked(), 4);

        // stale keys are pruned to make room
        let later = now + Duration::from_secs(180);
        tracker.record("fresh", later);
        assert_eq!(tracker.tracked(), 1);
    }
}
