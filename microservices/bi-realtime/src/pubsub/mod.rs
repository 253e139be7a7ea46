//! Real-time fan-out to dashboard subscribers

mod connection;
mod hub;
mod message;
mod notifier;
mod throttle;
mod transport;

pub use connection::{Connection, ConnectionInfo, ConnectionState, Delivery, LinkHealth};
pub use hub::{
    BroadcastReport, BroadcastScope, ChannelStats, EvictionReport, HealthState, HubHealth,
    HubReport, HubStats, PubSubHub,
};
pub use message::{Channel, ClientMessage, OutboundMessage, PushMessage, Role, ServerReply};
pub use notifier::{HubNotifier, METRICS_UPDATE};
pub use throttle::PriorityThrottle;
pub use transport::SubscriberTransport;
