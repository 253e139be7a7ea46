//! Consumer-group stream transport

use async_trait::async_trait;
use ehub_core::Result;
use std::time::Duration;

/// Field under which the encoded event is stored in each stream entry
pub const PAYLOAD_FIELD: &str = "event";

#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    pub stream: String,
    pub id: String,
    pub payload: Vec<u8>,
    /// 1 on first delivery, incremented every time the entry is claimed again
    pub delivery_count: u64,
}

/// Consumer-group operations over named streams.
///
/// Entries handed out by `read_group` stay pending for that consumer until
/// acknowledged. Pending entries idle past a lease can be claimed by any
/// consumer of the group.
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    fn backend(&self) -> &'static str;

    /// Create `group` on `stream` (creating the stream too) if it does not exist.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()>;

    /// Up to `count` never-delivered entries, waiting at most `block` for one.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>>;

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64>;

    /// Move up to `count` entries pending longer than `min_idle` to `consumer`.
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamMessage>>;

    /// Append an entry, returning its id.
    async fn publish(&self, stream: &str, payload: &[u8]) -> Result<String>;
}
