//! Counter updates per event type and the metrics derived from them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::event::{EntityKind, EventKind, LeadTemperature};
use super::window::{WindowBucket, WindowName};

pub mod counters {
    pub const TOTAL_INTERACTIONS: &str = "total_interactions";
    pub const HOT_LEADS: &str = "hot_leads";
    pub const WARM_LEADS: &str = "warm_leads";
    pub const COLD_LEADS: &str = "cold_leads";
    pub const LEAD_SCORE_SUM: &str = "lead_score_sum";
    pub const SCORED_LEADS: &str = "scored_leads";
    pub const COMMISSION_EVENTS: &str = "commission_events";
    pub const COMMISSION_TOTAL: &str = "commission_total";
    pub const DEAL_VALUE_TOTAL: &str = "deal_value_total";
    pub const BOT_REQUESTS: &str = "bot_requests";
    pub const BOT_SUCCESSES: &str = "bot_successes";
    pub const BOT_FAILURES: &str = "bot_failures";
    pub const RESPONSE_TIME_MS_SUM: &str = "response_time_ms_sum";
    pub const HEALTH_CHECKS: &str = "health_checks";
    pub const HEALTHY_CHECKS: &str = "healthy_checks";
    pub const LATENCY_MS_SUM: &str = "latency_ms_sum";
    pub const LATENCY_SAMPLES: &str = "latency_samples";
}

use counters::*;

/// Fold one event into a bucket
pub fn apply(bucket: &mut WindowBucket, kind: &EventKind) {
    bucket.events += 1;
    match kind {
        EventKind::LeadInteraction(lead) => {
            bucket.add(TOTAL_INTERACTIONS, 1.0);
            let bucket_name = match lead.temperature {
                LeadTemperature::Hot => HOT_LEADS,
                LeadTemperature::Warm => WARM_LEADS,
                LeadTemperature::Cold => COLD_LEADS,
            };
            bucket.add(bucket_name, 1.0);
            if let Some(score) = lead.lead_score.filter(|s| s.is_finite()) {
                bucket.add(LEAD_SCORE_SUM, score);
                bucket.add(SCORED_LEADS, 1.0);
            }
        }
        EventKind::CommissionEvent(commission) => {
            bucket.add(COMMISSION_EVENTS, 1.0);
            bucket.add(COMMISSION_TOTAL, finite(commission.amount));
            if let Some(deal) = commission.deal_value.filter(|v| v.is_finite()) {
                bucket.add(DEAL_VALUE_TOTAL, deal);
            }
        }
        EventKind::BotPerformance(bot) => {
            bucket.add(BOT_REQUESTS, 1.0);
            bucket.add(if bot.success { BOT_SUCCESSES } else { BOT_FAILURES }, 1.0);
            bucket.add(RESPONSE_TIME_MS_SUM, finite(bot.response_time_ms));
        }
        EventKind::SystemHealth(health) => {
            bucket.add(HEALTH_CHECKS, 1.0);
            if health.is_healthy() {
                bucket.add(HEALTHY_CHECKS, 1.0);
            }
            if let Some(latency) = health.latency_ms.filter(|v| v.is_finite()) {
                bucket.add(LATENCY_MS_SUM, latency);
                bucket.add(LATENCY_SAMPLES, 1.0);
            }
        }
    }
}

fn finite(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

/// A ratio carrying its raw operands. Zero denominators yield 0, never NaN.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ratio {
    pub value: f64,
    pub numerator: f64,
    pub denominator: f64,
}

impl Ratio {
    pub fn of(numerator: f64, denominator: f64) -> Self {
        let value = if denominator == 0.0 {
            0.0
        } else {
            let v = numerator / denominator;
            if v.is_finite() {
                v
            } else {
                0.0
            }
        };
        Self {
            value,
            numerator,
            denominator,
        }
    }
}

/// Derived metrics for whatever counter families the bucket holds
pub fn derive(bucket: &WindowBucket) -> BTreeMap<String, Ratio> {
    let c = |name| bucket.counter(name);
    let mut metrics = BTreeMap::new();
    let mut put = |name: &str, ratio: Ratio| {
        metrics.insert(name.to_string(), ratio);
    };

    if bucket.counters.contains_key(TOTAL_INTERACTIONS) {
        put("conversion_rate", Ratio::of(c(HOT_LEADS), c(TOTAL_INTERACTIONS)));
        put("avg_lead_score", Ratio::of(c(LEAD_SCORE_SUM), c(SCORED_LEADS)));
    }
    if bucket.counters.contains_key(COMMISSION_EVENTS) {
        put("avg_commission", Ratio::of(c(COMMISSION_TOTAL), c(COMMISSION_EVENTS)));
        put("commission_rate", Ratio::of(c(COMMISSION_TOTAL), c(DEAL_VALUE_TOTAL)));
    }
    if bucket.counters.contains_key(BOT_REQUESTS) {
        put("success_rate", Ratio::of(c(BOT_SUCCESSES), c(BOT_REQUESTS)));
        put("avg_response_time_ms", Ratio::of(c(RESPONSE_TIME_MS_SUM), c(BOT_REQUESTS)));
    }
    if bucket.counters.contains_key(HEALTH_CHECKS) {
        put("availability", Ratio::of(c(HEALTHY_CHECKS), c(HEALTH_CHECKS)));
        put("avg_latency_ms", Ratio::of(c(LATENCY_MS_SUM), c(LATENCY_SAMPLES)));
    }
    metrics
}

/// Materialized, read-only view of one bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub window: WindowName,
    pub entity_key: String,
    pub entity_kind: EntityKind,
    pub location_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub event_count: u64,
    pub counters: BTreeMap<String, f64>,
    pub metrics: BTreeMap<String, Ratio>,
    pub materialized_at: DateTime<Utc>,
}

impl AggregateSnapshot {
    pub fn from_bucket(
        bucket: &WindowBucket,
        entity_kind: EntityKind,
        location_id: &str,
        materialized_at: DateTime<Utc>,
    ) -> Self {
        Self {
            window: bucket.window_name,
            entity_key: bucket.entity_key.clone(),
            entity_kind,
            location_id: location_id.to_string(),
            window_start: bucket.window_start,
            window_end: bucket.window_end,
            event_count: bucket.events,
            counters: bucket.counters.clone(),
            metrics: derive(bucket),
            materialized_at,
        }
    }

    /// A counter or derived metric by name
    pub fn value(&self, name: &str) -> Option<f64> {
        self.counters
            .get(name)
            .copied()
            .or_else(|| self.metrics.get(name).map(|r| r.value))
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::event::{BotPerformance, LeadInteraction};

    fn bucket() -> WindowBucket {
        WindowBucket::open(WindowName::FiveMinutes, "loc1", Utc::now())
    }

    #[test]
    fn test_ratio_guards_zero() {
        let r = Ratio::of(5.0, 0.0);
        assert_eq!(r.value, 0.0);
        assert_eq!(r.numerator, 5.0);
        assert_eq!(Ratio::of(f64::INFINITY, 1.0).value, 0.0);
    }

    #[test]
    fn test_conversion_rate() {
        let mut b = bucket();
        for i in 0..10 {
            let temperature = if i < 2 { LeadTemperature::Hot } else { LeadTemperature::Cold };
            apply(
                &mut b,
                &EventKind::LeadInteraction(LeadInteraction {
                    temperature,
                    lead_score: None,
                }),
            );
        }
        let metrics = derive(&b);
        assert_eq!(metrics["conversion_rate"].value, 0.2);
        // no scored leads: guarded, not NaN
        assert_eq!(metrics["avg_lead_score"].value, 0.0);
        assert!(!metrics.contains_key("success_rate"));
    }

    #[test]
    fn test_bot_metrics() {
        let mut b = bucket();
        for (success, ms) in [(true, 100.0), (false, 300.0)] {
            apply(
                &mut b,
                &EventKind::BotPerformance(BotPerformance {
                    bot_type: "seller".into(),
                    success,
                    response_time_ms: ms,
                }),
            );
        }
        let metrics = derive(&b);
        assert_eq!(metrics["success_rate"].value, 0.5);
        assert_eq!(metrics["avg_response_time_ms"].value, 200.0);
    }
}
