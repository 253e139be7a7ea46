//! Windowed aggregation over typed events.
//!
//! Each entity key owns its own lock, so ingestion for different entities
//! never contends and updates to one entity are serialized. Windows rotate
//! on the injected clock: an event always lands in the window that is open
//! "now", never in the one its `occurred_at` belongs to.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ehub_core::Result;
use ehub_telemetry::Counter;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dedup::ShardedDedup;
use super::event::{DeadLetterReason, EntityKind, Event};
use super::metrics::{apply, AggregateSnapshot};
use super::window::{WindowBucket, WindowName};
use crate::cache::MultiTierCache;
use crate::clock::Clock;
use crate::config::AggregatorConfig;
use crate::streams::{EventHandler, StreamMessage};

/// Cache namespace holding materialized aggregates
pub const AGG_NAMESPACE: &str = "agg";

/// Key of a materialized aggregate within [`AGG_NAMESPACE`]
pub fn aggregate_key(window: WindowName, entity_key: &str) -> String {
    format!("{}:{}", window, entity_key)
}

/// Lifetime of a materialized `{window}:{entity}` key: the window's span.
/// `None` when the key does not start with a known window.
pub fn aggregate_ttl(key: &str) -> Option<std::time::Duration> {
    let (window, _) = key.split_once(':')?;
    window.parse::<WindowName>().ok().map(|w| w.std_duration())
}

/// Notified with every batch of freshly materialized snapshots
#[async_trait]
pub trait MaterializationListener: Send + Sync + 'static {
    async fn on_materialized(&self, window: WindowName, snapshots: &[AggregateSnapshot]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Applied,
    Duplicate,
    DeadLettered(DeadLetterReason),
}

#[derive(Default)]
struct WindowSlot {
    current: Option<WindowBucket>,
    /// Most recently closed bucket, kept until the next rotation
    previous: Option<WindowBucket>,
}

impl WindowSlot {
    fn rotate(&mut self, now: DateTime<Utc>) {
        if self.current.as_ref().is_some_and(|b| b.is_closed(now)) {
            self.previous = self.current.take();
        }
    }
}

struct EntityState {
    kind: EntityKind,
    location_id: String,
    slots: BTreeMap<WindowName, WindowSlot>,
    last_event_at: DateTime<Utc>,
    /// Set once the entity is removed from the map; ingesters holding a
    /// stale handle must retry against a fresh entry.
    retired: bool,
}

impl EntityState {
    fn new(kind: EntityKind, location_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            kind,
            location_id: location_id.to_string(),
            slots: WindowName::ALL
                .iter()
                .map(|w| (*w, WindowSlot::default()))
                .collect(),
            last_event_at: now,
            retired: false,
        }
    }

    fn apply(&mut self, entity_key: &str, event: &Event, now: DateTime<Utc>) {
        for (window, slot) in self.slots.iter_mut() {
            slot.rotate(now);
            let bucket = slot
                .current
                .get_or_insert_with(|| WindowBucket::open(*window, entity_key, now));
            apply(bucket, &event.kind);
        }
        if !event.location_id.as_str().is_empty() {
            self.location_id = event.location_id.as_str().to_string();
        }
        self.last_event_at = now;
    }

    fn snapshot(&mut self, window: WindowName, entity_key: &str, now: DateTime<Utc>) -> AggregateSnapshot {
        let slot = self.slots.entry(window).or_default();
        slot.rotate(now);
        match &slot.current {
            Some(bucket) => AggregateSnapshot::from_bucket(bucket, self.kind, &self.location_id, now),
            // quiet window: report it empty rather than stale
            None => AggregateSnapshot::from_bucket(
                &WindowBucket::open(window, entity_key, now),
                self.kind,
                &self.location_id,
                now,
            ),
        }
    }
}

struct AggregatorMetrics {
    ingested: Counter,
    duplicates: Counter,
    materializations: Counter,
    reclaimed: Counter,
    dead_letters: BTreeMap<DeadLetterReason, Counter>,
}

impl AggregatorMetrics {
    fn new() -> Self {
        Self {
            ingested: Counter::new("aggregator_events_ingested_total"),
            duplicates: Counter::new("aggregator_duplicates_total"),
            materializations: Counter::new("aggregator_materializations_total"),
            reclaimed: Counter::new("aggregator_entities_reclaimed_total"),
            dead_letters: DeadLetterReason::ALL
                .iter()
                .map(|r| (*r, Counter::new(&format!("aggregator_dead_letters_{}", r))))
                .collect(),
        }
    }

    fn dead_letter(&self, reason: DeadLetterReason) {
        if let Some(counter) = self.dead_letters.get(&reason) {
            counter.inc();
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregatorStats {
    pub events_ingested: u64,
    pub duplicates: u64,
    pub dead_letters: BTreeMap<String, u64>,
    pub dead_letters_total: u64,
    pub active_entities: usize,
    pub materializations: u64,
    pub reclaimed_entities: u64,
    pub dedup_tracked: usize,
}

struct AggregatorInner {
    entities: DashMap<String, Arc<Mutex<EntityState>>>,
    dedup: ShardedDedup,
    cache: MultiTierCache,
    clock: Arc<dyn Clock>,
    config: AggregatorConfig,
    listeners: RwLock<Vec<Arc<dyn MaterializationListener>>>,
    metrics: AggregatorMetrics,
}

#[derive(Clone)]
pub struct WindowAggregator {
    inner: Arc<AggregatorInner>,
}

impl WindowAggregator {
    pub fn new(config: AggregatorConfig, cache: MultiTierCache, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(AggregatorInner {
                entities: DashMap::new(),
                dedup: ShardedDedup::new(config.dedup_capacity, config.dedup_ttl),
                cache,
                clock,
                config,
                listeners: RwLock::new(Vec::new()),
                metrics: AggregatorMetrics::new(),
            }),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn MaterializationListener>) {
        self.inner.listeners.write().push(listener);
    }

    /// Decode and ingest one wire-format event. Undecodable input is counted
    /// as a dead letter and dropped.
    pub fn ingest_raw(&self, bytes: &[u8]) -> IngestOutcome {
        match Event::decode(bytes) {
            Ok(event) => self.ingest(&event),
            Err(reason) => self.dead_letter(reason, "undecodable event"),
        }
    }

    /// Fold `event` into every window of its entity.
    ///
    /// Redelivery of an already seen `event_id` is a no-op.
    pub fn ingest(&self, event: &Event) -> IngestOutcome {
        let entity_key = match event.entity_key() {
            Ok(key) => key,
            Err(reason) => return self.dead_letter(reason, event.event_id.as_str()),
        };

        if !self.inner.dedup.insert(event.event_id.as_str(), Instant::now()) {
            self.inner.metrics.duplicates.inc();
            debug!(event_id = %event.event_id, "Skipping duplicate event");
            return IngestOutcome::Duplicate;
        }

        let now = self.inner.clock.now();
        loop {
            let handle = self
                .inner
                .entities
                .entry(entity_key.clone())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(EntityState::new(
                        event.entity_kind(),
                        event.location_id.as_str(),
                        now,
                    )))
                })
                .clone();
            let mut state = handle.lock();
            if state.retired {
                continue;
            }
            state.apply(&entity_key, event, now);
            break;
        }

        self.inner.metrics.ingested.inc();
        IngestOutcome::Applied
    }

    fn dead_letter(&self, reason: DeadLetterReason, context: &str) -> IngestOutcome {
        self.inner.metrics.dead_letter(reason);
        warn!(reason = %reason, context = %context, "Dead-lettered event");
        IngestOutcome::DeadLettered(reason)
    }

    /// Snapshot of the window currently open for `entity_key`
    pub fn snapshot_entity(&self, window: WindowName, entity_key: &str) -> Option<AggregateSnapshot> {
        let handle = self.inner.entities.get(entity_key)?.clone();
        let now = self.inner.clock.now();
        let mut state = handle.lock();
        Some(state.snapshot(window, entity_key, now))
    }

    /// Snapshot of the last closed window for `entity_key`, if still retained
    pub fn previous_snapshot(&self, window: WindowName, entity_key: &str) -> Option<AggregateSnapshot> {
        let handle = self.inner.entities.get(entity_key)?.clone();
        let now = self.inner.clock.now();
        let mut state = handle.lock();
        let kind = state.kind;
        let location = state.location_id.clone();
        let slot = state.slots.get_mut(&window)?;
        slot.rotate(now);
        slot.previous
            .as_ref()
            .map(|bucket| AggregateSnapshot::from_bucket(bucket, kind, &location, now))
    }

    pub fn entity_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.entities.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Entity keys whose most recent event came from `location_id`
    pub fn entities_for_location(&self, location_id: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .entities
            .iter()
            .filter(|e| e.value().lock().location_id == location_id)
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Snapshot one entity and write it to the cache.
    pub async fn materialize_entity(&self, window: WindowName, entity_key: &str) -> Option<AggregateSnapshot> {
        let snapshot = self.snapshot_entity(window, entity_key)?;
        self.write_snapshot(&snapshot).await;
        Some(snapshot)
    }

    /// Snapshot every active entity for `window`, write each under
    /// `agg:{window}:{entity}` with a TTL of one window, then notify listeners.
    pub async fn materialize_window(&self, window: WindowName) -> usize {
        let started = Instant::now();
        let snapshots: Vec<AggregateSnapshot> = self
            .entity_keys()
            .iter()
            .filter_map(|key| self.snapshot_entity(window, key))
            .collect();

        for snapshot in &snapshots {
            self.write_snapshot(snapshot).await;
        }
        self.inner.metrics.materializations.inc();

        let listeners: Vec<Arc<dyn MaterializationListener>> = self.inner.listeners.read().clone();
        for listener in listeners {
            listener.on_materialized(window, &snapshots).await;
        }

        debug!(
            window = %window,
            entities = snapshots.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Materialized window"
        );
        snapshots.len()
    }

    async fn write_snapshot(&self, snapshot: &AggregateSnapshot) {
        self.inner
            .cache
            .set(
                &aggregate_key(snapshot.window, &snapshot.entity_key),
                snapshot.to_json(),
                AGG_NAMESPACE,
                snapshot.window.std_duration(),
            )
            .await;
    }

    /// Drop entities that have been quiet for longer than the largest window.
    pub fn reclaim_idle(&self) -> usize {
        let now = self.inner.clock.now();
        let horizon = WindowName::OneDay.duration();
        let before = self.inner.entities.len();
        self.inner.entities.retain(|_, handle| {
            // an entity busy right now is by definition not idle
            let Some(mut state) = handle.try_lock() else {
                return true;
            };
            if now - state.last_event_at > horizon {
                state.retired = true;
                false
            } else {
                true
            }
        });
        let reclaimed = before.saturating_sub(self.inner.entities.len());
        if reclaimed > 0 {
            self.inner.metrics.reclaimed.add(reclaimed as u64);
            info!(reclaimed, "Reclaimed idle aggregation entities");
        }
        reclaimed
    }

    pub fn stats(&self) -> AggregatorStats {
        let metrics = &self.inner.metrics;
        let dead_letters: BTreeMap<String, u64> = metrics
            .dead_letters
            .iter()
            .map(|(reason, counter)| (reason.as_str().to_string(), counter.get()))
            .collect();
        AggregatorStats {
            events_ingested: metrics.ingested.get(),
            duplicates: metrics.duplicates.get(),
            dead_letters_total: dead_letters.values().sum(),
            dead_letters,
            active_entities: self.inner.entities.len(),
            materializations: metrics.materializations.get(),
            reclaimed_entities: metrics.reclaimed.get(),
            dedup_tracked: self.inner.dedup.len(),
        }
    }

    /// Materialize on two cadences until cancelled: the short windows on the
    /// fast interval, the day window plus idle reclamation on the slow one.
    pub async fn run_materializer(self, cancel: CancellationToken) {
        let mut fast = tokio::time::interval(self.inner.config.fast_interval);
        fast.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut slow = tokio::time::interval(self.inner.config.slow_interval);
        slow.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            fast_secs = self.inner.config.fast_interval.as_secs(),
            slow_secs = self.inner.config.slow_interval.as_secs(),
            "Aggregation materializer started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Aggregation materializer stopping");
                    break;
                }
                _ = fast.tick() => {
                    self.materialize_window(WindowName::FiveMinutes).await;
                    self.materialize_window(WindowName::OneHour).await;
                }
                _ = slow.tick() => {
                    self.materialize_window(WindowName::OneDay).await;
                    self.reclaim_idle();
                }
            }
        }
    }
}

#[async_trait]
impl EventHandler for WindowAggregator {
    async fn handle(&self, message: &StreamMessage) -> Result<()> {
        // dead letters are acknowledged too: retrying cannot fix them
        self.ingest_raw(&message.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::event::LeadTemperature;
    use crate::clock::ManualClock;
    use crate::config::CacheConfig;
    use chrono::Duration;

    fn setup() -> (WindowAggregator, Arc<ManualClock>, MultiTierCache) {
        let clock = Arc::new(ManualClock::new("2024-05-01T10:00:00Z".parse().unwrap()));
        let cache = MultiTierCache::in_memory(&CacheConfig::default());
        let agg = WindowAggregator::new(AggregatorConfig::default(), cache.clone(), clock.clone());
        (agg, clock, cache)
    }

    #[test]
    fn test_duplicate_event_id_is_counted_once() {
        let (agg, _, _) = setup();
        let event = Event::lead("loc1", LeadTemperature::Hot).with_id("evt-1");
        assert_eq!(agg.ingest(&event), IngestOutcome::Applied);
        assert_eq!(agg.ingest(&event), IngestOutcome::Duplicate);

        let snap = agg.snapshot_entity(WindowName::FiveMinutes, "loc1").unwrap();
        assert_eq!(snap.value("total_interactions"), Some(1.0));
        assert_eq!(agg.stats().duplicates, 1);
    }

    #[test]
    fn test_dead_letters_do_not_block() {
        let (agg, _, _) = setup();
        assert_eq!(
            agg.ingest_raw(b"{\"broken\""),
            IngestOutcome::DeadLettered(DeadLetterReason::MalformedPayload)
        );
        assert_eq!(
            agg.ingest(&Event::lead("", LeadTemperature::Hot)),
            IngestOutcome::DeadLettered(DeadLetterReason::EmptyEntity)
        );
        assert_eq!(agg.ingest(&Event::lead("loc1", LeadTemperature::Cold)), IngestOutcome::Applied);

        let stats = agg.stats();
        assert_eq!(stats.dead_letters_total, 2);
        assert_eq!(stats.dead_letters["empty_entity"], 1);
        assert_eq!(stats.events_ingested, 1);
    }

    #[test]
    fn test_rotation_keeps_previous_bucket() {
        let (agg, clock, _) = setup();
        agg.ingest(&Event::lead("loc1", LeadTemperature::Hot));
        clock.advance(Duration::minutes(5));
        agg.ingest(&Event::lead("loc1", LeadTemperature::Cold));
        agg.ingest(&Event::lead("loc1", LeadTemperature::Cold));

        let current = agg.snapshot_entity(WindowName::FiveMinutes, "loc1").unwrap();
        assert_eq!(current.value("total_interactions"), Some(2.0));
        assert_eq!(current.value("hot_leads"), None);

        let previous = agg.previous_snapshot(WindowName::FiveMinutes, "loc1").unwrap();
        assert_eq!(previous.value("hot_leads"), Some(1.0));

        // the hour window spans both
        let hour = agg.snapshot_entity(WindowName::OneHour, "loc1").unwrap();
        assert_eq!(hour.value("total_interactions"), Some(3.0));
    }

    #[test]
    fn test_quiet_window_snapshots_empty() {
        let (agg, clock, _) = setup();
        agg.ingest(&Event::lead("loc1", LeadTemperature::Hot));
        clock.advance(Duration::minutes(12));
        let snap = agg.snapshot_entity(WindowName::FiveMinutes, "loc1").unwrap();
        assert_eq!(snap.event_count, 0);
        assert_eq!(snap.window_start, "2024-05-01T10:10:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[tokio::test]
    async fn test_materialize_writes_deterministic_key() {
        let (agg, _, cache) = setup();
        agg.ingest(&Event::lead("loc1", LeadTemperature::Hot));
        assert_eq!(agg.materialize_window(WindowName::FiveMinutes).await, 1);

        let cached = cache.get("5min:loc1", AGG_NAMESPACE).await.unwrap();
        assert_eq!(cached["counters"]["hot_leads"], 1.0);
        assert_eq!(cached["metrics"]["conversion_rate"]["value"], 1.0);
    }

    #[test]
    fn test_idle_entities_are_reclaimed() {
        let (agg, clock, _) = setup();
        agg.ingest(&Event::lead("old", LeadTemperature::Hot));
        clock.advance(Duration::hours(25));
        agg.ingest(&Event::lead("fresh", LeadTemperature::Hot));

        assert_eq!(agg.reclaim_idle(), 1);
        assert_eq!(agg.entity_keys(), vec!["fresh".to_string()]);

        // a late event recreates the entity from scratch
        agg.ingest(&Event::lead("old", LeadTemperature::Cold));
        let snap = agg.snapshot_entity(WindowName::OneDay, "old").unwrap();
        assert_eq!(snap.value("total_interactions"), Some(1.0));
    }
}
