//! Business events: the wire envelope and its typed variants

use chrono::{DateTime, Utc};
use ehub_core::{EventId, LocationId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Event as it travels on a stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub event_type: String,
    #[serde(default)]
    pub entity_id: String,
    #[serde(default)]
    pub location_id: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub occurred_at: DateTime<Utc>,
    pub event_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeadTemperature {
    Hot,
    Warm,
    Cold,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadInteraction {
    pub temperature: LeadTemperature,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommissionEvent {
    pub amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deal_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotPerformance {
    pub bot_type: String,
    pub success: bool,
    pub response_time_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    pub component: String,
    /// `healthy` counts as available; anything else does not
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
}

impl SystemHealth {
    pub fn is_healthy(&self) -> bool {
        self.status.eq_ignore_ascii_case("healthy")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    LeadInteraction(LeadInteraction),
    CommissionEvent(CommissionEvent),
    BotPerformance(BotPerformance),
    SystemHealth(SystemHealth),
}

impl EventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::LeadInteraction(_) => "lead_interaction",
            Self::CommissionEvent(_) => "commission_event",
            Self::BotPerformance(_) => "bot_performance",
            Self::SystemHealth(_) => "system_health",
        }
    }

    fn payload(&self) -> Result<Map<String, Value>, serde_json::Error> {
        let value = match self {
            Self::LeadInteraction(p) => serde_json::to_value(p)?,
            Self::CommissionEvent(p) => serde_json::to_value(p)?,
            Self::BotPerformance(p) => serde_json::to_value(p)?,
            Self::SystemHealth(p) => serde_json::to_value(p)?,
        };
        Ok(match value {
            Value::Object(map) => map,
            _ => Map::new(),
        })
    }
}

/// What an aggregate is keyed by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Lead and commission activity for one location
    Location,
    /// One bot type at one location
    Bot,
    /// A platform component, independent of location
    Component,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    UnknownEventType,
    MalformedPayload,
    EmptyEntity,
}

impl DeadLetterReason {
    pub const ALL: [DeadLetterReason; 3] =
        [Self::UnknownEventType, Self::MalformedPayload, Self::EmptyEntity];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownEventType => "unknown_event_type",
            Self::MalformedPayload => "malformed_payload",
            Self::EmptyEntity => "empty_entity",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded, routable event
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_id: EventId,
    pub entity_id: String,
    pub location_id: LocationId,
    pub occurred_at: DateTime<Utc>,
    pub kind: EventKind,
}

impl Event {
    pub fn new(location_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            event_id: EventId::generate(),
            entity_id: String::new(),
            location_id: LocationId::new(location_id),
            occurred_at: Utc::now(),
            kind,
        }
    }

    pub fn with_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = EventId::new(event_id);
        self
    }

    pub fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    pub fn lead(location_id: impl Into<String>, temperature: LeadTemperature) -> Self {
        Self::new(
            location_id,
            EventKind::LeadInteraction(LeadInteraction {
                temperature,
                lead_score: None,
            }),
        )
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DeadLetterReason> {
        let raw: RawEvent =
            serde_json::from_slice(bytes).map_err(|_| DeadLetterReason::MalformedPayload)?;
        Self::try_from(raw)
    }

    pub fn to_raw(&self) -> Result<RawEvent, serde_json::Error> {
        Ok(RawEvent {
            event_type: self.kind.event_type().to_string(),
            entity_id: self.entity_id.clone(),
            location_id: self.location_id.as_str().to_string(),
            payload: self.kind.payload()?,
            occurred_at: self.occurred_at,
            event_id: self.event_id.as_str().to_string(),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.to_raw()?)
    }

    pub fn entity_kind(&self) -> EntityKind {
        match &self.kind {
            EventKind::LeadInteraction(_) | EventKind::CommissionEvent(_) => EntityKind::Location,
            EventKind::BotPerformance(_) => EntityKind::Bot,
            EventKind::SystemHealth(_) => EntityKind::Component,
        }
    }

    /// Aggregation key: the location for lead and commission activity,
    /// `bot_type:location_id` for bots, `component:{name}` for health.
    pub fn entity_key(&self) -> Result<String, DeadLetterReason> {
        let location = self.location_id.as_str().trim();
        let key = match &self.kind {
            EventKind::LeadInteraction(_) | EventKind::CommissionEvent(_) => {
                if location.is_empty() {
                    return Err(DeadLetterReason::EmptyEntity);
                }
                location.to_string()
            }
            EventKind::BotPerformance(bot) => {
                if location.is_empty() || bot.bot_type.trim().is_empty() {
                    return Err(DeadLetterReason::EmptyEntity);
                }
                format!("{}:{}", bot.bot_type.trim(), location)
            }
            EventKind::SystemHealth(health) => {
                if health.component.trim().is_empty() {
                    return Err(DeadLetterReason::EmptyEntity);
                }
                format!("component:{}", health.component.trim())
            }
        };
        Ok(key)
    }
}

impl TryFrom<RawEvent> for Event {
    type Error = DeadLetterReason;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        if raw.event_id.trim().is_empty() {
            return Err(DeadLetterReason::MalformedPayload);
        }
        let payload = Value::Object(raw.payload);
        let kind = match raw.event_type.as_str() {
            "lead_interaction" => EventKind::LeadInteraction(typed(payload)?),
            "commission_event" => EventKind::CommissionEvent(typed(payload)?),
            "bot_performance" => EventKind::BotPerformance(typed(payload)?),
            "system_health" => EventKind::SystemHealth(typed(payload)?),
            _ => return Err(DeadLetterReason::UnknownEventType),
        };
        Ok(Self {
            event_id: EventId::new(raw.event_id),
            entity_id: raw.entity_id,
            location_id: LocationId::new(raw.location_id),
            occurred_at: raw.occurred_at,
            kind,
        })
    }
}

fn typed<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, DeadLetterReason> {
    serde_json::from_value(payload).map_err(|_| DeadLetterReason::MalformedPayload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(event_type: &str, payload: Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "event_type": event_type,
            "entity_id": "contact-1",
            "location_id": "loc1",
            "payload": payload,
            "occurred_at": "2024-05-01T10:00:00Z",
            "event_id": "evt-1"
        }))
        .unwrap()
    }

    #[test]
    fn test_decode_lead_interaction() {
        let event = Event::decode(&raw("lead_interaction", json!({"temperature": "hot", "lead_score": 87.0}))).unwrap();
        assert_eq!(event.entity_key().unwrap(), "loc1");
        assert_eq!(event.event_id.as_str(), "evt-1");
        match event.kind {
            EventKind::LeadInteraction(lead) => {
                assert_eq!(lead.temperature, LeadTemperature::Hot);
                assert_eq!(lead.lead_score, Some(87.0));
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_bot_and_health_entity_keys() {
        let bot = Event::decode(&raw(
            "bot_performance",
            json!({"bot_type": "seller", "success": true, "response_time_ms": 120.0}),
        ))
        .unwrap();
        assert_eq!(bot.entity_key().unwrap(), "seller:loc1");
        assert_eq!(bot.entity_kind(), EntityKind::Bot);

        let health = Event::decode(&raw("system_health", json!({"component": "redis", "status": "healthy"}))).unwrap();
        assert_eq!(health.entity_key().unwrap(), "component:redis");
    }

    #[test]
    fn test_dead_letter_reasons() {
        assert_eq!(
            Event::decode(&raw("page_view", json!({}))).unwrap_err(),
            DeadLetterReason::UnknownEventType
        );
        assert_eq!(
            Event::decode(&raw("commission_event", json!({"amount": "lots"}))).unwrap_err(),
            DeadLetterReason::MalformedPayload
        );
        assert_eq!(Event::decode(b"not json").unwrap_err(), DeadLetterReason::MalformedPayload);

        let nowhere = Event::lead("", LeadTemperature::Cold);
        assert_eq!(nowhere.entity_key().unwrap_err(), DeadLetterReason::EmptyEntity);
    }

    #[test]
    fn test_encode_keeps_identity() {
        let event = Event::lead("loc9", LeadTemperature::Warm).with_id("evt-42");
        let decoded = Event::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded.event_id.as_str(), "evt-42");
        assert_eq!(decoded.kind, event.kind);
    }
}
