//! Sliding-window aggregation of business events

mod aggregator;
mod dedup;
mod event;
mod metrics;
mod window;

pub use aggregator::{
    aggregate_key, aggregate_ttl, AggregatorStats, IngestOutcome, MaterializationListener, WindowAggregator,
    AGG_NAMESPACE,
};
pub use dedup::{DedupSet, ShardedDedup};
pub use event::{
    BotPerformance, CommissionEvent, DeadLetterReason, EntityKind, Event, EventKind,
    LeadInteraction, LeadTemperature, RawEvent, SystemHealth,
};
pub use metrics::{apply as apply_event, counters, derive, AggregateSnapshot, Ratio};
pub use window::{WindowBucket, WindowName};
