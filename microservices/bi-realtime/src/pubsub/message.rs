//! Hub wire types: channels, roles, pushed messages and the client protocol

use chrono::{DateTime, Utc};
use ehub_core::{LocationId, Priority};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Dashboard,
    Leads,
    Commissions,
    BotPerformance,
    SystemHealth,
    Alerts,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Self::Dashboard,
        Self::Leads,
        Self::Commissions,
        Self::BotPerformance,
        Self::SystemHealth,
        Self::Alerts,
    ];

    /// Subscribed when a client asks for nothing usable
    pub const DEFAULT: [Channel; 2] = [Self::Dashboard, Self::SystemHealth];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dashboard => "dashboard",
            Self::Leads => "leads",
            Self::Commissions => "commissions",
            Self::BotPerformance => "bot_performance",
            Self::SystemHealth => "system_health",
            Self::Alerts => "alerts",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown channel '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Manager,
    Agent,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Manager => "manager",
            Self::Agent => "agent",
            Self::Viewer => "viewer",
        }
    }
}

impl Default for Role {
    fn default() -> Self {
        Self::Viewer
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "manager" => Ok(Self::Manager),
            "agent" => Ok(Self::Agent),
            "viewer" => Ok(Self::Viewer),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// A message to fan out, with the routing data that never reaches the client
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub channel: Channel,
    pub event_type: String,
    pub component: Option<String>,
    pub data: Value,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    pub message_id: String,
    /// Only connections of this location receive it when location filtering is on
    pub location_id: Option<LocationId>,
    pub target_roles: Option<BTreeSet<Role>>,
    pub ttl_seconds: Option<u64>,
    pub requires_ack: bool,
}

impl OutboundMessage {
    pub fn new(channel: Channel, event_type: impl Into<String>, data: Value) -> Self {
        Self {
            channel,
            event_type: event_type.into(),
            component: None,
            data,
            priority: Priority::Normal,
            timestamp: Utc::now(),
            message_id: Uuid::new_v4().to_string(),
            location_id: None,
            target_roles: None,
            ttl_seconds: None,
            requires_ack: false,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn location(mut self, location_id: LocationId) -> Self {
        self.location_id = Some(location_id);
        self
    }

    pub fn roles(mut self, roles: impl IntoIterator<Item = Role>) -> Self {
        self.target_roles = Some(roles.into_iter().collect());
        self
    }

    pub fn ttl(mut self, seconds: u64) -> Self {
        self.ttl_seconds = Some(seconds);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn requiring_ack(mut self) -> Self {
        self.requires_ack = true;
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_seconds {
            Some(ttl) => (now - self.timestamp).num_milliseconds() > (ttl as i64).saturating_mul(1000),
            None => false,
        }
    }

    pub fn to_push(&self) -> PushMessage<'_> {
        PushMessage {
            channel: self.channel,
            event_type: &self.event_type,
            component: self.component.as_deref(),
            data: &self.data,
            priority: self.priority,
            timestamp: self.timestamp,
            message_id: &self.message_id,
            requires_ack: self.requires_ack,
        }
    }
}

/// What a subscriber actually receives
#[derive(Debug, Serialize)]
pub struct PushMessage<'a> {
    pub channel: Channel,
    pub event_type: &'a str,
    pub component: Option<&'a str>,
    pub data: &'a Value,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    pub message_id: &'a str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub requires_ack: bool,
}

/// Client-to-hub messages
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    SubscribeChannel { channel: String },
    SubscribeComponent { component: String },
    Heartbeat,
    Ack { message_id: String },
}

/// Hub-to-client control replies
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerReply {
    Connected {
        connection_id: String,
        channels: Vec<Channel>,
    },
    Subscribed {
        #[serde(skip_serializing_if = "Option::is_none")]
        channel: Option<Channel>,
        #[serde(skip_serializing_if = "Option::is_none")]
        component: Option<String>,
    },
    HeartbeatAck {
        timestamp: DateTime<Utc>,
    },
    AckReceived {
        message_id: String,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerReply {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_channel_names_round_trip() {
        for channel in Channel::ALL {
            assert_eq!(channel.as_str().parse::<Channel>().unwrap(), channel);
        }
        assert!("weather".parse::<Channel>().is_err());
    }

    #[test]
    fn test_push_wire_format() {
        let msg = OutboundMessage::new(Channel::SystemHealth, "metrics_update", json!({"ok": true}))
            .component("redis")
            .priority(Priority::Critical)
            .location(LocationId::new("loc1"));
        let wire = serde_json::to_value(msg.to_push()).unwrap();

        assert_eq!(wire["channel"], "system_health");
        assert_eq!(wire["component"], "redis");
        assert_eq!(wire["priority"], "critical");
        assert_eq!(wire["data"]["ok"], true);
        // routing metadata stays server-side
        assert!(wire.get("location_id").is_none());
        assert!(wire.get("requires_ack").is_none());
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let msg = OutboundMessage::new(Channel::Alerts, "x", Value::Null)
            .at(now - Duration::seconds(10))
            .ttl(5);
        assert!(msg.is_expired(now));
        assert!(!msg.clone().ttl(30).is_expired(now));
        assert!(!OutboundMessage::new(Channel::Alerts, "x", Value::Null).is_expired(now));
    }

    #[test]
    fn test_client_protocol() {
        let sub: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe_channel","channel":"leads"}"#).unwrap();
        assert_eq!(sub, ClientMessage::SubscribeChannel { channel: "leads".into() });

        let hb: ClientMessage = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(hb, ClientMessage::Heartbeat);

        let reply = serde_json::to_value(ServerReply::AckReceived { message_id: "m1".into() }).unwrap();
        assert_eq!(reply["type"], "ack_received");
    }
}
