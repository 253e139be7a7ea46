//! BI Realtime
//!
//! Event-driven business intelligence serving pipeline:
//! - Consumer-group stream ingestion with at-least-once delivery
//! - Sliding-window aggregation (5min / 1hr / 24hr) per location, bot and component
//! - Multi-tier cache (in-process LRU + shared L2) with single-flight and predictive warming
//! - Channel pub/sub fan-out to dashboards with per-priority throttling

pub mod aggregation;
pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod pubsub;
pub mod query;
mod redis_support;
pub mod service;
pub mod streams;
pub mod tasks;

pub use config::BiConfig;
pub use error::{Error, Result};
pub use service::{Backends, BiRealtimeService};
