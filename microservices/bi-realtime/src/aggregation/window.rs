//! Tumbling windows aligned to the epoch

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WindowName {
    #[serde(rename = "5min")]
    FiveMinutes,
    #[serde(rename = "1hr")]
    OneHour,
    #[serde(rename = "24hr")]
    OneDay,
}

impl WindowName {
    pub const ALL: [WindowName; 3] = [Self::FiveMinutes, Self::OneHour, Self::OneDay];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FiveMinutes => "5min",
            Self::OneHour => "1hr",
            Self::OneDay => "24hr",
        }
    }

    pub fn seconds(&self) -> i64 {
        match self {
            Self::FiveMinutes => 300,
            Self::OneHour => 3600,
            Self::OneDay => 86_400,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.seconds())
    }

    pub fn std_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.seconds() as u64)
    }

    /// Start of the window containing `at`
    pub fn align(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let secs = at.timestamp().div_euclid(self.seconds()) * self.seconds();
        Utc.timestamp_opt(secs, 0).single().unwrap_or(at)
    }

    /// `[start, end)` of the window containing `at`
    pub fn bounds(&self, at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = self.align(at);
        (start, start + self.duration())
    }
}

impl fmt::Display for WindowName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WindowName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|w| w.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// Counters accumulated for one entity over one window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowBucket {
    pub window_name: WindowName,
    pub entity_key: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub counters: BTreeMap<String, f64>,
    pub events: u64,
}

impl WindowBucket {
    pub fn open(window_name: WindowName, entity_key: &str, now: DateTime<Utc>) -> Self {
        let (window_start, window_end) = window_name.bounds(now);
        Self {
            window_name,
            entity_key: entity_key.to_string(),
            window_start,
            window_end,
            counters: BTreeMap::new(),
            events: 0,
        }
    }

    pub fn is_closed(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_end
    }

    pub fn add(&mut self, counter: &str, amount: f64) {
        *self.counters.entry(counter.to_string()).or_insert(0.0) += amount;
    }

    pub fn counter(&self, name: &str) -> f64 {
        self.counters.get(name).copied().unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_align_to_window_start() {
        let t = at("2024-05-01T10:07:31Z");
        assert_eq!(WindowName::FiveMinutes.align(t), at("2024-05-01T10:05:00Z"));
        assert_eq!(WindowName::OneHour.align(t), at("2024-05-01T10:00:00Z"));
        assert_eq!(WindowName::OneDay.align(t), at("2024-05-01T00:00:00Z"));
    }

    #[test]
    fn test_bucket_closes_at_end() {
        let bucket = WindowBucket::open(WindowName::FiveMinutes, "loc1", at("2024-05-01T10:07:31Z"));
        assert!(!bucket.is_closed(at("2024-05-01T10:09:59Z")));
        assert!(bucket.is_closed(at("2024-05-01T10:10:00Z")));
    }

    #[test]
    fn test_window_name_parse() {
        assert_eq!("1hr".parse::<WindowName>().unwrap(), WindowName::OneHour);
        assert!("2hr".parse::<WindowName>().is_err());
        assert_eq!(serde_json::to_string(&WindowName::OneDay).unwrap(), "\"24hr\"");
    }
}
