//! Subscriber connections: routing attributes, link quality and the
//! CONNECTING -> CONNECTED -> DEGRADED -> DISCONNECTED state machine

use chrono::{DateTime, Utc};
use ehub_core::{LocationId, Priority};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::message::{Channel, OutboundMessage, Role};
use super::throttle::PriorityThrottle;
use super::transport::SubscriberTransport;
use crate::config::HubConfig;

/// Quality a degraded link must climb back to before it is trusted again
const RECOVER_QUALITY: f64 = 0.7;
/// Error rate a degraded link must fall under before it is trusted again
const RECOVER_ERROR_RATE: f64 = 0.05;
/// Smallest quality drop on a failed send
const MIN_QUALITY_PENALTY: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Degraded,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Degraded => "DEGRADED",
            Self::Disconnected => "DISCONNECTED",
        }
    }
}

/// Rolling delivery outcomes and the quality score derived from them
#[derive(Debug)]
pub struct LinkHealth {
    state: ConnectionState,
    quality: f64,
    outcomes: VecDeque<bool>,
    window: usize,
    consecutive_failures: u32,
    degrade_error_rate: f64,
    degrade_quality: f64,
    max_consecutive_failures: u32,
}

impl LinkHealth {
    pub fn new(config: &HubConfig) -> Self {
        Self {
            state: ConnectionState::Connecting,
            quality: 1.0,
            outcomes: VecDeque::with_capacity(config.outcome_window),
            window: config.outcome_window.max(1),
            consecutive_failures: 0,
            degrade_error_rate: config.degrade_error_rate,
            degrade_quality: config.degrade_quality,
            max_consecutive_failures: config.max_consecutive_failures,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn quality(&self) -> f64 {
        self.quality
    }

    pub fn error_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / self.outcomes.len() as f64
    }

    pub fn mark_connected(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Connected;
        }
    }

    pub fn mark_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    /// Fold one send outcome in and re-evaluate the state.
    /// Returns the new state when it changed.
    pub fn record(&mut self, success: bool) -> Option<ConnectionState> {
        if self.state == ConnectionState::Disconnected {
            return None;
        }
        if self.outcomes.len() == self.window {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);

        let error_rate = self.error_rate();
        if success {
            self.consecutive_failures = 0;
            self.quality += (1.0 - self.quality) * 0.1;
        } else {
            self.consecutive_failures += 1;
            self.quality -= (self.quality * error_rate).max(MIN_QUALITY_PENALTY);
        }
        self.quality = self.quality.clamp(0.0, 1.0);

        let previous = self.state;
        self.state = if self.consecutive_failures >= self.max_consecutive_failures {
            ConnectionState::Disconnected
        } else {
            match previous {
                ConnectionState::Connected
                    if error_rate > self.degrade_error_rate || self.quality < self.degrade_quality =>
                {
                    ConnectionState::Degraded
                }
                ConnectionState::Degraded
                    if error_rate <= RECOVER_ERROR_RATE && self.quality >= RECOVER_QUALITY =>
                {
                    ConnectionState::Connected
                }
                other => other,
            }
        };
        (self.state != previous).then_some(self.state)
    }

    /// Degraded links only get critical traffic
    pub fn admits(&self, priority: Priority) -> bool {
        match self.state {
            ConnectionState::Connected => true,
            ConnectionState::Degraded => priority == Priority::Critical,
            ConnectionState::Connecting | ConnectionState::Disconnected => false,
        }
    }
}

/// Result of one delivery attempt to one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Throttled,
    /// Not admitted in the current state (degraded, connecting or closed)
    Suppressed,
    Failed,
}

struct ConnectionInner {
    health: LinkHealth,
    throttle: PriorityThrottle,
    channels: BTreeSet<Channel>,
    components: BTreeSet<String>,
    last_activity: Instant,
    pending_acks: VecDeque<String>,
    sent: u64,
    failed: u64,
    throttled: u64,
}

pub struct Connection {
    id: String,
    location_id: LocationId,
    role: Role,
    connected_at: DateTime<Utc>,
    transport: Arc<dyn SubscriberTransport>,
    send_timeout: Duration,
    max_pending_acks: usize,
    inner: Mutex<ConnectionInner>,
}

/// Point-in-time view of a connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub location_id: String,
    pub role: Role,
    pub state: ConnectionState,
    pub quality: f64,
    pub error_rate: f64,
    pub channels: Vec<Channel>,
    pub components: Vec<String>,
    pub pending_acks: usize,
    pub messages_sent: u64,
    pub messages_failed: u64,
    pub messages_throttled: u64,
    pub idle_secs: u64,
    pub connected_at: DateTime<Utc>,
}

impl Connection {
    pub fn new(
        id: String,
        location_id: LocationId,
        role: Role,
        channels: BTreeSet<Channel>,
        components: BTreeSet<String>,
        transport: Arc<dyn SubscriberTransport>,
        config: &HubConfig,
    ) -> Self {
        Self {
            id,
            location_id,
            role,
            connected_at: Utc::now(),
            transport,
            send_timeout: config.send_timeout,
            max_pending_acks: config.max_pending_acks,
            inner: Mutex::new(ConnectionInner {
                health: LinkHealth::new(config),
                throttle: PriorityThrottle::new(config.limits, config.throttle_window),
                channels,
                components,
                last_activity: Instant::now(),
                pending_acks: VecDeque::new(),
                sent: 0,
                failed: 0,
                throttled: 0,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn location_id(&self) -> &LocationId {
        &self.location_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().health.state()
    }

    pub fn quality(&self) -> f64 {
        self.inner.lock().health.quality()
    }

    pub fn error_rate(&self) -> f64 {
        self.inner.lock().health.error_rate()
    }

    pub fn channels(&self) -> BTreeSet<Channel> {
        self.inner.lock().channels.clone()
    }

    pub fn components(&self) -> BTreeSet<String> {
        self.inner.lock().components.clone()
    }

    pub fn mark_connected(&self) {
        self.inner.lock().health.mark_connected();
    }

    pub fn mark_disconnected(&self) {
        self.inner.lock().health.mark_disconnected();
    }

    /// Returns false if already subscribed
    pub fn add_channel(&self, channel: Channel) -> bool {
        self.inner.lock().channels.insert(channel)
    }

    pub fn add_component(&self, component: &str) -> bool {
        self.inner.lock().components.insert(component.to_string())
    }

    pub fn touch(&self) {
        self.inner.lock().last_activity = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.inner.lock().last_activity)
    }

    /// Clear a pending ack; false if it was not outstanding
    pub fn acknowledge(&self, message_id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.pending_acks.iter().position(|id| id == message_id) {
            Some(idx) => {
                inner.pending_acks.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn pending_acks(&self) -> usize {
        self.inner.lock().pending_acks.len()
    }

    /// Attempt one delivery: state gate, throttle, then a bounded send.
    ///
    /// The lock is never held across the send, so a slow socket cannot stall
    /// other broadcasts touching this connection's bookkeeping.
    pub async fn deliver(&self, message: &OutboundMessage, frame: &str) -> Delivery {
        {
            let mut inner = self.inner.lock();
            if !inner.health.admits(message.priority) {
                return Delivery::Suppressed;
            }
            if !inner.throttle.try_acquire(message.priority, Instant::now()) {
                inner.throttled += 1;
                return Delivery::Throttled;
            }
        }

        let result = match tokio::time::timeout(self.send_timeout, self.transport.send(frame)).await {
            Ok(result) => result,
            Err(_) => Err(ehub_core::EhubError::Timeout(format!(
                "send exceeded {:?}",
                self.send_timeout
            ))),
        };

        let mut inner = self.inner.lock();
        let success = result.is_ok();
        if let Err(e) = &result {
            inner.failed += 1;
            debug!(connection_id = %self.id, error = %e, "Delivery failed");
        } else {
            inner.sent += 1;
            inner.last_activity = Instant::now();
            if message.requires_ack {
                if inner.pending_acks.len() >= self.max_pending_acks {
                    inner.pending_acks.pop_front();
                }
                inner.pending_acks.push_back(message.message_id.clone());
            }
        }

        if let Some(state) = inner.health.record(success) {
            let quality = inner.health.quality();
            let error_rate = inner.health.error_rate();
            match state {
                ConnectionState::Degraded | ConnectionState::Disconnected => warn!(
                    connection_id = %self.id,
                    state = state.as_str(),
                    quality,
                    error_rate,
                    "Connection state changed"
                ),
                _ => info!(
                    connection_id = %self.id,
                    state = state.as_str(),
                    quality,
                    "Connection state changed"
                ),
            }
        }

        if success {
            Delivery::Delivered
        } else {
            Delivery::Failed
        }
    }

    pub async fn close(&self) {
        self.mark_disconnected();
        self.transport.close().await;
    }

    pub fn info(&self) -> ConnectionInfo {
        let inner = self.inner.lock();
        ConnectionInfo {
            connection_id: self.id.clone(),
            location_id: self.location_id.to_string(),
            role: self.role,
            state: inner.health.state(),
            quality: inner.health.quality(),
            error_rate: inner.health.error_rate(),
            channels: inner.channels.iter().copied().collect(),
            components: inner.components.iter().cloned().collect(),
            pending_acks: inner.pending_acks.len(),
            messages_sent: inner.sent,
            messages_failed: inner.failed,
            messages_throttled: inner.throttled,
            idle_secs: Instant::now().saturating_duration_since(inner.last_activity).as_secs(),
            connected_at: self.connected_at,
        }
    }
}
