//! Channel fan-out hub
//!
//! Connections are indexed by channel and by component. A broadcast resolves
//! its targets from a snapshot of those indices and then delivers to every
//! target concurrently, so connects and disconnects never wait on a slow
//! broadcast and one failing subscriber never affects the rest.

use chrono::Utc;
use dashmap::DashMap;
use ehub_core::{LocationId, Priority};
use ehub_telemetry::Counter;
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connection::{Connection, ConnectionInfo, ConnectionState, Delivery};
use super::message::{Channel, ClientMessage, OutboundMessage, Role, ServerReply};
use super::transport::SubscriberTransport;
use crate::config::HubConfig;
use crate::tasks::{BackgroundTasks, TaskStatus};

/// Which filters a broadcast applies on top of channel and component
#[derive(Debug, Clone, Copy)]
pub struct BroadcastScope {
    pub filter_by_location: bool,
    pub filter_by_role: bool,
}

impl Default for BroadcastScope {
    fn default() -> Self {
        Self {
            filter_by_location: true,
            filter_by_role: true,
        }
    }
}

impl BroadcastScope {
    pub fn everywhere() -> Self {
        Self {
            filter_by_location: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub targeted: usize,
    pub delivered: usize,
    pub throttled: usize,
    pub suppressed: usize,
    pub failed: usize,
    pub expired: bool,
}

struct ChannelCounters {
    delivered: Counter,
    throttled: Counter,
    suppressed: Counter,
    expired: Counter,
    failed: Counter,
}

impl ChannelCounters {
    fn new(channel: Channel) -> Self {
        let name = |what: &str| format!("hub_{}_{}_total", channel.as_str(), what);
        Self {
            delivered: Counter::new(&name("delivered")),
            throttled: Counter::new(&name("throttled")),
            suppressed: Counter::new(&name("suppressed")),
            expired: Counter::new(&name("expired")),
            failed: Counter::new(&name("failed")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ChannelStats {
    pub subscribers: usize,
    pub delivered: u64,
    pub throttled: u64,
    pub suppressed: u64,
    pub expired: u64,
    pub failed: u64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub by_state: BTreeMap<ConnectionState, usize>,
    pub channels: BTreeMap<Channel, ChannelStats>,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub evicted_idle: u64,
    pub evicted_unhealthy: u64,
}

/// Periodic throughput snapshot produced by the metrics reporter
#[derive(Debug, Clone, Serialize)]
pub struct HubReport {
    pub at: chrono::DateTime<Utc>,
    pub interval_secs: f64,
    pub active_connections: usize,
    pub degraded_connections: usize,
    /// Deliveries per second since the previous report
    pub throughput: BTreeMap<Channel, f64>,
    pub error_rates: BTreeMap<Channel, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubHealth {
    pub status: HealthState,
    pub connections: usize,
    pub channel_subscriptions: BTreeMap<Channel, usize>,
    pub background_tasks_running: bool,
    pub tasks: Vec<TaskStatus>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub idle: usize,
    pub unhealthy: usize,
    pub closed: usize,
}

impl EvictionReport {
    pub fn total(&self) -> usize {
        self.idle + self.unhealthy + self.closed
    }
}

struct HubInner {
    config: HubConfig,
    connections: DashMap<String, Arc<Connection>>,
    channel_index: DashMap<Channel, HashSet<String>>,
    component_index: DashMap<String, HashSet<String>>,
    channel_counters: BTreeMap<Channel, ChannelCounters>,
    opened: Counter,
    closed: Counter,
    evicted_idle: Counter,
    evicted_unhealthy: Counter,
    tasks: BackgroundTasks,
    last_report: RwLock<Option<HubReport>>,
}

#[derive(Clone)]
pub struct PubSubHub {
    inner: Arc<HubInner>,
}

impl PubSubHub {
    pub fn new(config: HubConfig, tasks: BackgroundTasks) -> Self {
        Self {
            inner: Arc::new(HubInner {
                config,
                connections: DashMap::new(),
                channel_index: DashMap::new(),
                component_index: DashMap::new(),
                channel_counters: Channel::ALL
                    .into_iter()
                    .map(|c| (c, ChannelCounters::new(c)))
                    .collect(),
                opened: Counter::new("hub_connections_opened_total"),
                closed: Counter::new("hub_connections_closed_total"),
                evicted_idle: Counter::new("hub_evicted_idle_total"),
                evicted_unhealthy: Counter::new("hub_evicted_unhealthy_total"),
                tasks,
                last_report: RwLock::new(None),
            }),
        }
    }

    /// Register a subscriber and return its connection id.
    ///
    /// Unknown channel names are skipped with a warning; if none are left the
    /// connection gets [`Channel::DEFAULT`].
    pub fn connect(
        &self,
        transport: Arc<dyn SubscriberTransport>,
        location_id: LocationId,
        role: Role,
        channels: &[String],
        components: &[String],
    ) -> String {
        let mut resolved: BTreeSet<Channel> = BTreeSet::new();
        for name in channels {
            match name.parse::<Channel>() {
                Ok(channel) => {
                    resolved.insert(channel);
                }
                Err(e) => warn!(channel = %name, error = %e, "Ignoring unknown channel"),
            }
        }
        if resolved.is_empty() {
            resolved.extend(Channel::DEFAULT);
        }
        let components: BTreeSet<String> = components
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();

        let id = Uuid::new_v4().to_string();
        let connection = Arc::new(Connection::new(
            id.clone(),
            location_id,
            role,
            resolved.clone(),
            components.clone(),
            transport,
            &self.inner.config,
        ));

        self.inner.connections.insert(id.clone(), connection.clone());
        for channel in &resolved {
            self.index_channel(*channel, &id);
        }
        for component in &components {
            self.index_component(component, &id);
        }
        connection.mark_connected();
        self.inner.opened.inc();

        info!(
            connection_id = %id,
            location_id = %connection.location_id(),
            role = connection.role().as_str(),
            channels = resolved.len(),
            components = components.len(),
            "Subscriber connected"
        );
        id
    }

    fn index_channel(&self, channel: Channel, id: &str) {
        self.inner
            .channel_index
            .entry(channel)
            .or_default()
            .insert(id.to_string());
    }

    fn index_component(&self, component: &str, id: &str) {
        self.inner
            .component_index
            .entry(component.to_string())
            .or_default()
            .insert(id.to_string());
    }

    /// Index a late channel subscription. A disconnect that removed the
    /// connection before the insert landed would never see this entry, so
    /// membership is checked again afterwards.
    fn index_late_channel(&self, channel: Channel, id: &str) {
        self.index_channel(channel, id);
        if !self.inner.connections.contains_key(id) {
            if let Some(mut ids) = self.inner.channel_index.get_mut(&channel) {
                ids.remove(id);
            }
        }
    }

    fn index_late_component(&self, component: &str, id: &str) {
        self.index_component(component, id);
        if !self.inner.connections.contains_key(id) {
            if let Some(mut ids) = self.inner.component_index.get_mut(component) {
                ids.remove(id);
            }
            self.inner
                .component_index
                .remove_if(component, |_, ids| ids.is_empty());
        }
    }

    /// Record transport-level activity (pings, pongs) for a connection
    pub fn touch(&self, connection_id: &str) {
        if let Some(connection) = self.inner.connections.get(connection_id) {
            connection.touch();
        }
    }

    pub fn connection(&self, connection_id: &str) -> Option<ConnectionInfo> {
        self.inner.connections.get(connection_id).map(|c| c.info())
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Remove a connection from every index and close its transport.
    pub async fn disconnect(&self, connection_id: &str) -> bool {
        let Some((_, connection)) = self.inner.connections.remove(connection_id) else {
            return false;
        };
        for channel in connection.channels() {
            if let Some(mut ids) = self.inner.channel_index.get_mut(&channel) {
                ids.remove(connection_id);
            }
        }
        for component in connection.components() {
            if let Some(mut ids) = self.inner.component_index.get_mut(&component) {
                ids.remove(connection_id);
            }
        }
        self.inner
            .component_index
            .retain(|_, ids| !ids.is_empty());
        connection.close().await;
        self.inner.closed.inc();
        debug!(connection_id = %connection_id, "Subscriber disconnected");
        true
    }

    /// Connections that should receive `message`: channel subscribers,
    /// narrowed by component, location and role as requested.
    fn resolve_targets(&self, message: &OutboundMessage, scope: BroadcastScope) -> Vec<Arc<Connection>> {
        let mut ids: HashSet<String> = match self.inner.channel_index.get(&message.channel) {
            Some(ids) => ids.clone(),
            None => return Vec::new(),
        };
        if let Some(component) = &message.component {
            match self.inner.component_index.get(component) {
                Some(subscribers) => ids.retain(|id| subscribers.contains(id)),
                None => return Vec::new(),
            }
        }

        ids.iter()
            .filter_map(|id| self.inner.connections.get(id).map(|c| c.clone()))
            .filter(|conn| {
                !scope.filter_by_location
                    || message
                        .location_id
                        .as_ref()
                        .map_or(true, |loc| conn.location_id() == loc)
            })
            .filter(|conn| {
                !scope.filter_by_role
                    || message
                        .target_roles
                        .as_ref()
                        .map_or(true, |roles| roles.contains(&conn.role()))
            })
            .collect()
    }

    /// Fan `message` out to every resolved subscriber.
    ///
    /// Expired messages are dropped before any delivery. Per-connection
    /// throttling, state gating and send failures are counted, not raised.
    pub async fn broadcast(&self, message: &OutboundMessage, scope: BroadcastScope) -> BroadcastReport {
        let counters = &self.inner.channel_counters[&message.channel];
        if message.is_expired(Utc::now()) {
            counters.expired.inc();
            debug!(message_id = %message.message_id, "Dropping expired message");
            return BroadcastReport {
                expired: true,
                ..BroadcastReport::default()
            };
        }

        let targets = self.resolve_targets(message, scope);
        if targets.is_empty() {
            return BroadcastReport::default();
        }
        let frame = match serde_json::to_string(&message.to_push()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Failed to serialize push message");
                return BroadcastReport::default();
            }
        };

        let outcomes = join_all(targets.iter().map(|conn| conn.deliver(message, &frame))).await;
        let report = self.tally(message.channel, targets.len(), &outcomes);

        let dead: Vec<&str> = targets
            .iter()
            .filter(|c| c.state() == ConnectionState::Disconnected)
            .map(|c| c.id())
            .collect();
        for id in dead {
            self.disconnect(id).await;
        }
        report
    }

    fn tally(&self, channel: Channel, targeted: usize, outcomes: &[Delivery]) -> BroadcastReport {
        let counters = &self.inner.channel_counters[&channel];
        let mut report = BroadcastReport {
            targeted,
            ..BroadcastReport::default()
        };
        for outcome in outcomes {
            match outcome {
                Delivery::Delivered => {
                    report.delivered += 1;
                    counters.delivered.inc();
                }
                Delivery::Throttled => {
                    report.throttled += 1;
                    counters.throttled.inc();
                }
                Delivery::Suppressed => {
                    report.suppressed += 1;
                    counters.suppressed.inc();
                }
                Delivery::Failed => {
                    report.failed += 1;
                    counters.failed.inc();
                }
            }
        }
        report
    }

    /// Deliver to a single connection, subject to the same gates as a broadcast.
    pub async fn send_to(&self, connection_id: &str, message: &OutboundMessage) -> Option<Delivery> {
        let connection = self.inner.connections.get(connection_id)?.clone();
        if message.is_expired(Utc::now()) {
            self.inner.channel_counters[&message.channel].expired.inc();
            return Some(Delivery::Suppressed);
        }
        let frame = serde_json::to_string(&message.to_push()).ok()?;
        let outcome = connection.deliver(message, &frame).await;
        self.tally(message.channel, 1, &[outcome]);
        if connection.state() == ConnectionState::Disconnected {
            self.disconnect(connection_id).await;
        }
        Some(outcome)
    }

    /// Apply a client protocol message and produce the reply to send back.
    pub fn handle_client_message(&self, connection_id: &str, message: ClientMessage) -> ServerReply {
        let Some(connection) = self.inner.connections.get(connection_id).map(|c| c.clone()) else {
            return ServerReply::error("unknown_connection", connection_id);
        };
        connection.touch();

        match message {
            ClientMessage::SubscribeChannel { channel } => match channel.parse::<Channel>() {
                Ok(parsed) => {
                    if connection.add_channel(parsed) {
                        self.index_late_channel(parsed, connection_id);
                    }
                    ServerReply::Subscribed {
                        channel: Some(parsed),
                        component: None,
                    }
                }
                Err(e) => {
                    warn!(connection_id = %connection_id, channel = %channel, "Rejected unknown channel");
                    ServerReply::error("unknown_channel", e)
                }
            },
            ClientMessage::SubscribeComponent { component } => {
                let component = component.trim().to_string();
                if component.is_empty() {
                    return ServerReply::error("invalid_component", "component must not be empty");
                }
                if connection.add_component(&component) {
                    self.index_late_component(&component, connection_id);
                }
                ServerReply::Subscribed {
                    channel: None,
                    component: Some(component),
                }
            }
            ClientMessage::Heartbeat => ServerReply::HeartbeatAck { timestamp: Utc::now() },
            ClientMessage::Ack { message_id } => {
                if !connection.acknowledge(&message_id) {
                    debug!(connection_id = %connection_id, message_id = %message_id, "Ack for unknown message");
                }
                ServerReply::AckReceived { message_id }
            }
        }
    }

    /// Parse a raw client frame and apply it. Undecodable frames get an
    /// error reply but still count as activity.
    pub fn handle_client_frame(&self, connection_id: &str, frame: &str) -> ServerReply {
        match serde_json::from_str::<ClientMessage>(frame) {
            Ok(message) => self.handle_client_message(connection_id, message),
            Err(e) => {
                self.touch(connection_id);
                ServerReply::error("invalid_message", e.to_string())
            }
        }
    }

    /// One monitor pass: drop closed, idle and persistently unhealthy
    /// connections.
    pub async fn evict_stale(&self) -> EvictionReport {
        let config = &self.inner.config;
        let now = Instant::now();
        let mut report = EvictionReport::default();
        let mut doomed = Vec::new();

        for entry in self.inner.connections.iter() {
            let conn = entry.value();
            if conn.state() == ConnectionState::Disconnected {
                report.closed += 1;
                doomed.push(conn.id().to_string());
            } else if conn.idle_for(now) > config.idle_timeout {
                report.idle += 1;
                self.inner.evicted_idle.inc();
                doomed.push(conn.id().to_string());
            } else if conn.quality() < config.evict_quality && conn.error_rate() > config.degrade_error_rate {
                report.unhealthy += 1;
                self.inner.evicted_unhealthy.inc();
                doomed.push(conn.id().to_string());
            }
        }

        for id in &doomed {
            self.disconnect(id).await;
        }
        if report.total() > 0 {
            info!(
                idle = report.idle,
                unhealthy = report.unhealthy,
                closed = report.closed,
                "Evicted subscriber connections"
            );
        }
        report
    }

    pub fn stats(&self) -> HubStats {
        let mut by_state: BTreeMap<ConnectionState, usize> = BTreeMap::new();
        for entry in self.inner.connections.iter() {
            *by_state.entry(entry.value().state()).or_default() += 1;
        }
        let channels = Channel::ALL
            .into_iter()
            .map(|channel| (channel, self.channel_stats(channel)))
            .collect();

        HubStats {
            connections: self.inner.connections.len(),
            by_state,
            channels,
            connections_opened: self.inner.opened.get(),
            connections_closed: self.inner.closed.get(),
            evicted_idle: self.inner.evicted_idle.get(),
            evicted_unhealthy: self.inner.evicted_unhealthy.get(),
        }
    }

    fn channel_stats(&self, channel: Channel) -> ChannelStats {
        let counters = &self.inner.channel_counters[&channel];
        let delivered = counters.delivered.get();
        let failed = counters.failed.get();
        let attempts = delivered + failed;
        ChannelStats {
            subscribers: self.subscriber_count(channel),
            delivered,
            throttled: counters.throttled.get(),
            suppressed: counters.suppressed.get(),
            expired: counters.expired.get(),
            failed,
            error_rate: if attempts == 0 {
                0.0
            } else {
                failed as f64 / attempts as f64
            },
        }
    }

    fn subscriber_count(&self, channel: Channel) -> usize {
        self.inner
            .channel_index
            .get(&channel)
            .map(|ids| ids.len())
            .unwrap_or(0)
    }

    pub fn health(&self) -> HubHealth {
        let tasks = &self.inner.tasks;
        let registered = tasks.registered();
        let running = tasks.running();
        let connections = self.inner.connections.len();
        let degraded = self
            .inner
            .connections
            .iter()
            .filter(|c| c.value().state() == ConnectionState::Degraded)
            .count();

        let status = if registered > 0 && running == 0 {
            HealthState::Unhealthy
        } else if running < registered || degraded * 2 > connections {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };

        HubHealth {
            status,
            connections,
            channel_subscriptions: Channel::ALL
                .into_iter()
                .map(|c| (c, self.subscriber_count(c)))
                .collect(),
            background_tasks_running: registered > 0 && running == registered,
            tasks: tasks.statuses(),
        }
    }

    pub fn last_report(&self) -> Option<HubReport> {
        self.inner.last_report.read().clone()
    }

    /// Build a throughput report against the previous delivered totals.
    fn report(&self, previous: &BTreeMap<Channel, u64>, elapsed_secs: f64) -> (HubReport, BTreeMap<Channel, u64>) {
        let stats = self.stats();
        let totals: BTreeMap<Channel, u64> = stats
            .channels
            .iter()
            .map(|(c, s)| (*c, s.delivered))
            .collect();
        let throughput = totals
            .iter()
            .map(|(c, total)| {
                let delta = total.saturating_sub(previous.get(c).copied().unwrap_or(0));
                (*c, if elapsed_secs > 0.0 { delta as f64 / elapsed_secs } else { 0.0 })
            })
            .collect();
        let report = HubReport {
            at: Utc::now(),
            interval_secs: elapsed_secs,
            active_connections: stats.connections,
            degraded_connections: stats
                .by_state
                .get(&ConnectionState::Degraded)
                .copied()
                .unwrap_or(0),
            throughput,
            error_rates: stats.channels.iter().map(|(c, s)| (*c, s.error_rate)).collect(),
        };
        (report, totals)
    }

    /// Spawn the connection monitor and the metrics reporter as children of
    /// `cancel`.
    pub fn spawn_maintenance(&self, cancel: &CancellationToken) {
        let monitor = self.clone();
        let token = cancel.child_token();
        self.inner.tasks.spawn("hub:monitor", async move {
            let mut ticker = tokio::time::interval(monitor.inner.config.monitor_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.evict_stale().await;
                    }
                }
            }
            debug!("Connection monitor stopped");
        });

        let reporter = self.clone();
        let token = cancel.child_token();
        self.inner.tasks.spawn("hub:metrics", async move {
            let mut ticker = tokio::time::interval(reporter.inner.config.metrics_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut previous = BTreeMap::new();
            let mut last = Instant::now();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        let (report, totals) = reporter.report(&previous, now.duration_since(last).as_secs_f64());
                        info!(
                            active_connections = report.active_connections,
                            degraded_connections = report.degraded_connections,
                            dashboard_per_sec = report.throughput.get(&Channel::Dashboard).copied().unwrap_or(0.0),
                            "Hub metrics"
                        );
                        *reporter.inner.last_report.write() = Some(report);
                        previous = totals;
                        last = now;
                    }
                }
            }
            debug!("Hub metrics reporter stopped");
        });
    }

    /// Close every connection; used on shutdown.
    pub async fn close_all(&self) -> usize {
        let ids: Vec<String> = self.inner.connections.iter().map(|e| e.key().clone()).collect();
        for id in &ids {
            self.disconnect(id).await;
        }
        ids.len()
    }

    /// Convenience for system-wide critical alerts.
    pub async fn alert(&self, event_type: &str, data: serde_json::Value) -> BroadcastReport {
        let message = OutboundMessage::new(Channel::Alerts, event_type, data).priority(Priority::Critical);
        self.broadcast(&message, BroadcastScope::everywhere()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::transport::testing::RecordingTransport;
    use serde_json::json;
    use std::time::Duration;

    fn hub() -> PubSubHub {
        PubSubHub::new(HubConfig::default(), BackgroundTasks::new())
    }

    fn join(hub: &PubSubHub, loc: &str, role: Role, channels: &[&str]) -> (String, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let channels: Vec<String> = channels.iter().map(|c| c.to_string()).collect();
        let id = hub.connect(transport.clone(), LocationId::new(loc), role, &channels, &[]);
        (id, transport)
    }

    #[tokio::test]
    async fn test_unknown_channels_fall_back_to_defaults() {
        let hub = hub();
        let (id, _) = join(&hub, "loc1", Role::Agent, &["weather", "stocks"]);
        let info = hub.connection(&id).unwrap();
        assert_eq!(info.channels, vec![Channel::Dashboard, Channel::SystemHealth]);
        assert_eq!(info.state, ConnectionState::Connected);

        let (id, _) = join(&hub, "loc1", Role::Agent, &["leads", "weather"]);
        assert_eq!(hub.connection(&id).unwrap().channels, vec![Channel::Leads]);
    }

    #[tokio::test]
    async fn test_location_and_role_filters() {
        let hub = hub();
        let (_, a) = join(&hub, "loc1", Role::Manager, &["dashboard"]);
        let (_, b) = join(&hub, "loc1", Role::Viewer, &["dashboard"]);
        let (_, c) = join(&hub, "loc2", Role::Manager, &["dashboard"]);

        let msg = OutboundMessage::new(Channel::Dashboard, "kpi", json!({}))
            .location(LocationId::new("loc1"))
            .roles([Role::Manager, Role::Admin]);
        let report = hub.broadcast(&msg, BroadcastScope::default()).await;
        assert_eq!(report.delivered, 1);
        assert_eq!((a.count(), b.count(), c.count()), (1, 0, 0));

        let report = hub
            .broadcast(&msg, BroadcastScope { filter_by_location: false, filter_by_role: false })
            .await;
        assert_eq!(report.delivered, 3);
    }

    #[tokio::test]
    async fn test_component_messages_need_component_subscription() {
        let hub = hub();
        let (plain, plain_tx) = join(&hub, "loc1", Role::Admin, &["system_health"]);
        let (watcher, watcher_tx) = join(&hub, "loc1", Role::Admin, &["system_health"]);
        hub.handle_client_message(&watcher, ClientMessage::SubscribeComponent { component: "redis".into() });

        let msg = OutboundMessage::new(Channel::SystemHealth, "metrics_update", json!({})).component("redis");
        hub.broadcast(&msg, BroadcastScope::everywhere()).await;
        assert_eq!(watcher_tx.count(), 1);
        assert_eq!(plain_tx.count(), 0);
        assert!(hub.connection(&plain).is_some());
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_connection() {
        let hub = hub();
        let (bad, bad_tx) = join(&hub, "loc1", Role::Agent, &["alerts"]);
        let (_, good_tx) = join(&hub, "loc1", Role::Agent, &["alerts"]);
        bad_tx.script(&[false, false, false]);

        for _ in 0..3 {
            let msg = OutboundMessage::new(Channel::Alerts, "x", json!({})).priority(Priority::Critical);
            hub.broadcast(&msg, BroadcastScope::everywhere()).await;
        }
        assert_eq!(good_tx.count(), 3);
        // three consecutive failures: gone from the registry
        assert!(hub.connection(&bad).is_none());
        assert!(bad_tx.closed.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(hub.stats().channels[&Channel::Alerts].failed, 3);
    }

    #[tokio::test]
    async fn test_expired_message_is_not_delivered() {
        let hub = hub();
        let (_, tx) = join(&hub, "loc1", Role::Agent, &["leads"]);
        let msg = OutboundMessage::new(Channel::Leads, "lead", json!({}))
            .at(Utc::now() - chrono::Duration::seconds(120))
            .ttl(60);
        let report = hub.broadcast(&msg, BroadcastScope::default()).await;
        assert!(report.expired);
        assert_eq!(tx.count(), 0);
        assert_eq!(hub.stats().channels[&Channel::Leads].expired, 1);
    }

    #[tokio::test]
    async fn test_disconnect_clears_indices() {
        let hub = hub();
        let (id, _) = join(&hub, "loc1", Role::Agent, &["leads", "alerts"]);
        hub.handle_client_message(&id, ClientMessage::SubscribeComponent { component: "bots".into() });
        assert_eq!(hub.health().channel_subscriptions[&Channel::Leads], 1);

        assert!(hub.disconnect(&id).await);
        assert!(!hub.disconnect(&id).await);
        let health = hub.health();
        assert_eq!(health.connections, 0);
        assert!(health.channel_subscriptions.values().all(|n| *n == 0));
    }

    #[tokio::test]
    async fn test_idle_connections_evicted_unless_heartbeating() {
        let hub = PubSubHub::new(
            HubConfig {
                idle_timeout: Duration::from_millis(150),
                ..HubConfig::default()
            },
            BackgroundTasks::new(),
        );
        let (idle, _) = join(&hub, "loc1", Role::Agent, &[]);
        let (live, _) = join(&hub, "loc1", Role::Agent, &[]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let reply = hub.handle_client_message(&live, ClientMessage::Heartbeat);
        assert!(matches!(reply, ServerReply::HeartbeatAck { .. }));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let report = hub.evict_stale().await;
        assert_eq!(report.idle, 1);
        assert!(hub.connection(&idle).is_none());
        assert!(hub.connection(&live).is_some());
    }

    #[tokio::test]
    async fn test_push_only_subscriber_is_not_idle() {
        let hub = PubSubHub::new(
            HubConfig {
                idle_timeout: Duration::from_millis(150),
                ..HubConfig::default()
            },
            BackgroundTasks::new(),
        );
        let (id, transport) = join(&hub, "loc1", Role::Manager, &["dashboard"]);
        let update = OutboundMessage::new(Channel::Dashboard, "kpi", json!({ "leads": 1 }));

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let report = hub.broadcast(&update, BroadcastScope::everywhere()).await;
            assert_eq!(report.delivered, 1);
        }

        let report = hub.evict_stale().await;
        assert_eq!(report.idle, 0);
        assert!(hub.connection(&id).is_some());
        assert_eq!(transport.count(), 4);
    }

    #[tokio::test]
    async fn test_pings_keep_connection_alive() {
        let hub = PubSubHub::new(
            HubConfig {
                idle_timeout: Duration::from_millis(150),
                ..HubConfig::default()
            },
            BackgroundTasks::new(),
        );
        let (id, _) = join(&hub, "loc1", Role::Agent, &[]);
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            hub.touch(&id);
        }
        assert_eq!(hub.evict_stale().await.idle, 0);
        assert!(hub.connection(&id).is_some());
    }

    #[tokio::test]
    async fn test_late_subscription_after_disconnect_leaves_no_index_entry() {
        let hub = hub();
        let (id, _) = join(&hub, "loc1", Role::Agent, &["leads"]);
        assert!(hub.disconnect(&id).await);

        // subscribe handler finishing after the disconnect already ran
        hub.index_late_channel(Channel::Alerts, &id);
        hub.index_late_component("bots", &id);

        assert_eq!(hub.subscriber_count(Channel::Alerts), 0);
        assert!(hub.inner.component_index.get("bots").is_none());
    }

    #[tokio::test]
    async fn test_health_reflects_background_tasks() {
        let tasks = BackgroundTasks::new();
        let hub = PubSubHub::new(HubConfig::default(), tasks.clone());
        assert_eq!(hub.health().status, HealthState::Healthy);
        assert!(!hub.health().background_tasks_running);

        let cancel = CancellationToken::new();
        hub.spawn_maintenance(&cancel);
        tokio::task::yield_now().await;
        let health = hub.health();
        assert_eq!(health.status, HealthState::Healthy);
        assert!(health.background_tasks_running);

        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hub.health().status, HealthState::Unhealthy);
    }

    #[tokio::test]
    async fn test_client_frames() {
        let hub = hub();
        let (id, _) = join(&hub, "loc1", Role::Agent, &[]);
        let reply = hub.handle_client_frame(&id, r#"{"type":"subscribe_channel","channel":"alerts"}"#);
        assert_eq!(
            reply,
            ServerReply::Subscribed { channel: Some(Channel::Alerts), component: None }
        );
        let reply = hub.handle_client_frame(&id, r#"{"type":"subscribe_channel","channel":"nope"}"#);
        assert!(matches!(reply, ServerReply::Error { .. }));
        let reply = hub.handle_client_frame(&id, "not json");
        assert!(matches!(reply, ServerReply::Error { .. }));
    }
}
