//! Pushes freshly materialized aggregates to dashboard subscribers

use async_trait::async_trait;
use ehub_core::{LocationId, Priority};
use futures_util::future::join_all;
use tracing::debug;

use super::hub::{BroadcastScope, PubSubHub};
use super::message::{Channel, OutboundMessage};
use crate::aggregation::{AggregateSnapshot, EntityKind, MaterializationListener, WindowName};

pub const METRICS_UPDATE: &str = "metrics_update";

/// Publishes one `metrics_update` per entity for every 5min materialization.
pub struct HubNotifier {
    hub: PubSubHub,
}

impl HubNotifier {
    pub fn new(hub: PubSubHub) -> Self {
        Self { hub }
    }

    fn route(snapshot: &AggregateSnapshot) -> (OutboundMessage, BroadcastScope) {
        let data = snapshot.to_json();
        match snapshot.entity_kind {
            EntityKind::Location => (
                OutboundMessage::new(Channel::Dashboard, METRICS_UPDATE, data)
                    .location(LocationId::new(snapshot.location_id.clone())),
                BroadcastScope::default(),
            ),
            EntityKind::Bot => (
                OutboundMessage::new(Channel::BotPerformance, METRICS_UPDATE, data)
                    .location(LocationId::new(snapshot.location_id.clone())),
                BroadcastScope::default(),
            ),
            EntityKind::Component => {
                let component = snapshot
                    .entity_key
                    .strip_prefix("component:")
                    .unwrap_or(&snapshot.entity_key)
                    .to_string();
                let priority = match snapshot.value("availability") {
                    Some(availability) if availability < 1.0 => Priority::High,
                    _ => Priority::Normal,
                };
                (
                    OutboundMessage::new(Channel::SystemHealth, METRICS_UPDATE, data)
                        .component(component)
                        .priority(priority),
                    BroadcastScope::everywhere(),
                )
            }
        }
    }
}

#[async_trait]
impl MaterializationListener for HubNotifier {
    async fn on_materialized(&self, window: WindowName, snapshots: &[AggregateSnapshot]) {
        if window != WindowName::FiveMinutes || snapshots.is_empty() {
            return;
        }
        let routed: Vec<(OutboundMessage, BroadcastScope)> = snapshots.iter().map(Self::route).collect();
        let reports = join_all(
            routed
                .iter()
                .map(|(message, scope)| self.hub.broadcast(message, *scope)),
        )
        .await;
        let delivered: usize = reports.iter().map(|r| r.delivered).sum();
        debug!(entities = snapshots.len(), delivered, "Pushed metrics updates");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{Event, EventKind, SystemHealth, WindowBucket};
    use chrono::Utc;

    fn health_snapshot(healthy: bool) -> AggregateSnapshot {
        let event = Event::new(
            "",
            EventKind::SystemHealth(SystemHealth {
                component: "redis".into(),
                status: if healthy { "healthy" } else { "down" }.into(),
                latency_ms: Some(3.0),
            }),
        );
        let key = event.entity_key().unwrap();
        let mut bucket = WindowBucket::open(WindowName::FiveMinutes, &key, Utc::now());
        crate::aggregation::apply_event(&mut bucket, &event.kind);
        AggregateSnapshot::from_bucket(&bucket, EntityKind::Component, "", Utc::now())
    }

    #[test]
    fn test_component_routing() {
        let (message, scope) = HubNotifier::route(&health_snapshot(false));
        assert_eq!(message.channel, Channel::SystemHealth);
        assert_eq!(message.component.as_deref(), Some("redis"));
        assert_eq!(message.priority, Priority::High);
        assert!(!scope.filter_by_location);

        let (message, _) = HubNotifier::route(&health_snapshot(true));
        assert_eq!(message.priority, Priority::Normal);
    }
}
