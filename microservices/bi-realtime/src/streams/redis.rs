//! Redis Streams transport (XREADGROUP / XACK / XCLAIM)

use async_trait::async_trait;
use dashmap::DashMap;
use ehub_core::{EhubError, Result};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, info};

use super::transport::{StreamMessage, StreamTransport, PAYLOAD_FIELD};
use crate::redis_support::{bounded, connect, map_redis_error};

pub struct RedisStreams {
    client: redis::Client,
    conn: ConnectionManager,
    /// One connection per stream for blocking reads, so a parked
    /// XREADGROUP never delays acks or publishes
    readers: DashMap<String, MultiplexedConnection>,
    timeout: Duration,
}

impl RedisStreams {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let (client, conn) = connect(url).await?;
        info!(backend = "redis", "Stream transport connected");
        Ok(Self {
            client,
            conn,
            readers: DashMap::new(),
            timeout,
        })
    }

    async fn reader(&self, stream: &str) -> Result<MultiplexedConnection> {
        if let Some(conn) = self.readers.get(stream) {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        self.readers.insert(stream.to_string(), conn.clone());
        Ok(conn)
    }

    fn to_message(stream: &str, entry: &StreamId, delivery_count: u64) -> StreamMessage {
        StreamMessage {
            stream: stream.to_string(),
            id: entry.id.clone(),
            // entries without the field decode as malformed and get dead-lettered
            payload: entry.get::<Vec<u8>>(PAYLOAD_FIELD).unwrap_or_default(),
            delivery_count,
        }
    }
}

/// `XPENDING stream group IDLE ms - + count`: only entries idle at least `min_idle_ms`
fn pending_idle_command(stream: &str, group: &str, min_idle_ms: usize, count: usize) -> redis::Cmd {
    redis::cmd("XPENDING")
        .arg(stream)
        .arg(group)
        .arg("IDLE")
        .arg(min_idle_ms)
        .arg("-")
        .arg("+")
        .arg(count)
        .to_owned()
}

#[async_trait]
impl StreamTransport for RedisStreams {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = match tokio::time::timeout(
            self.timeout,
            conn.xgroup_create_mkstream(stream, group, "0"),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                return Err(EhubError::Timeout(format!(
                    "XGROUP CREATE {} exceeded {:?}",
                    stream, self.timeout
                )))
            }
        };
        match created {
            Ok(()) => {
                info!(stream = %stream, group = %group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(stream = %stream, group = %group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(map_redis_error(e)),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>> {
        let mut conn = self.reader(stream).await?;
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);
        let reply: Option<StreamReadReply> = bounded(block + self.timeout, "XREADGROUP", async move {
            conn.xread_options(&[stream], &[">"], &options).await
        })
        .await
        .map_err(|e| {
            // drop the connection so the next read reconnects
            self.readers.remove(stream);
            e
        })?;

        Ok(reply
            .map(|reply| {
                reply
                    .keys
                    .iter()
                    .flat_map(|key| key.ids.iter().map(|entry| Self::to_message(&key.key, entry, 1)))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        bounded(self.timeout, "XACK", async move { conn.xack(stream, group, ids).await }).await
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamMessage>> {
        let min_idle_ms = min_idle.as_millis() as usize;
        // IDLE filters server-side, so a slow but live consumer holding the
        // oldest entries cannot hide stale ones behind them
        let mut conn = self.conn.clone();
        let query = pending_idle_command(stream, group, min_idle_ms, count);
        let pending: StreamPendingCountReply = bounded(self.timeout, "XPENDING", async move {
            query.query_async(&mut conn).await
        })
        .await?;

        let stale: Vec<(String, u64)> = pending
            .ids
            .iter()
            .filter(|p| p.last_delivered_ms >= min_idle_ms)
            .map(|p| (p.id.clone(), p.times_delivered as u64))
            .collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = stale.iter().map(|(id, _)| id.clone()).collect();
        let mut conn = self.conn.clone();
        let claimed: StreamClaimReply = bounded(self.timeout, "XCLAIM", async move {
            conn.xclaim(stream, group, consumer, min_idle_ms, &ids).await
        })
        .await?;

        Ok(claimed
            .ids
            .iter()
            .map(|entry| {
                let previous = stale
                    .iter()
                    .find(|(id, _)| *id == entry.id)
                    .map(|(_, n)| *n)
                    .unwrap_or(1);
                Self::to_message(stream, entry, previous + 1)
            })
            .collect())
    }

    async fn publish(&self, stream: &str, payload: &[u8]) -> Result<String> {
        let mut conn = self.conn.clone();
        bounded(self.timeout, "XADD", async move {
            conn.xadd(stream, "*", &[(PAYLOAD_FIELD, payload)]).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_scan_filters_by_idle_time() {
        let packed = pending_idle_command("bi:events:leads", "bi-aggregators", 30000, 10).get_packed_command();
        let packed = String::from_utf8_lossy(&packed);
        assert!(packed.starts_with("*8\r\n$8\r\nXPENDING\r\n"));
        assert!(packed.ends_with("$4\r\nIDLE\r\n$5\r\n30000\r\n$1\r\n-\r\n$1\r\n+\r\n$2\r\n10\r\n"));
    }
}
