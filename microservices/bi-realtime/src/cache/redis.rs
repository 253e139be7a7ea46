//! Redis-backed L2 tier

use async_trait::async_trait;
use ehub_core::Result;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::debug;

use super::shared::SharedCache;
use crate::redis_support::{bounded, connect};

const SCAN_BATCH: usize = 500;

/// Escape SCAN MATCH metacharacters so a prefix only matches itself
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[derive(Clone)]
pub struct RedisSharedCache {
    conn: ConnectionManager,
    timeout: Duration,
}

impl RedisSharedCache {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let (_, conn) = connect(url).await?;
        debug!(backend = "redis", "L2 cache connected");
        Ok(Self { conn, timeout })
    }
}

#[async_trait]
impl SharedCache for RedisSharedCache {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        bounded(self.timeout, "GET", async move { conn.get(key).await }).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let ttl_secs = ttl.as_secs().max(1);
        bounded(self.timeout, "SETEX", async move { conn.set_ex(key, value, ttl_secs).await }).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 =
            bounded(self.timeout, "DEL", async move { conn.del(key).await }).await?;
        Ok(removed > 0)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}*", escape_glob(prefix));
        let mut cursor: u64 = 0;
        let mut deleted = Vec::new();
        loop {
            let mut conn = self.conn.clone();
            let scan = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .to_owned();
            let (next, keys): (u64, Vec<String>) =
                bounded(self.timeout, "SCAN", async move { scan.query_async(&mut conn).await })
                    .await?;

            if !keys.is_empty() {
                let mut conn = self.conn.clone();
                let batch = keys.clone();
                let _: i64 =
                    bounded(self.timeout, "DEL", async move { conn.del(batch).await }).await?;
                deleted.extend(keys);
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(deleted)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = bounded(self.timeout, "PING", async move {
            redis::cmd("PING").query_async(&mut conn).await
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_glob_is_escaped() {
        assert_eq!(escape_glob("bi:analytics:"), "bi:analytics:");
        assert_eq!(escape_glob("bi:[loc]*?:"), r"bi:\[loc\]\*\?:");
        assert_eq!(escape_glob(r"a\b:"), r"a\\b:");
    }
}
