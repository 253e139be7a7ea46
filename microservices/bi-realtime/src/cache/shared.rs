//! L2 tier abstraction: the cross-instance source of truth.

use async_trait::async_trait;
use dashmap::DashMap;
use ehub_core::{EhubError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Shared key/value store behind the in-process tier.
///
/// Implementations expire entries on their own; nothing above this trait
/// evicts from L2 explicitly except namespace invalidation.
#[async_trait]
pub trait SharedCache: Send + Sync + 'static {
    fn backend(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete every key starting with `prefix`, returning the deleted keys.
    async fn delete_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    async fn ping(&self) -> Result<()>;
}

/// In-process L2 used when no Redis is configured, and in tests.
///
/// `set_available(false)` simulates an unreachable backend.
#[derive(Default)]
pub struct MemorySharedCache {
    entries: DashMap<String, (Vec<u8>, Instant)>,
    unavailable: AtomicBool,
}

impl MemorySharedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.value().1 > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EhubError::Network("memory L2 marked unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SharedCache for MemorySharedCache {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        let now = Instant::now();
        let hit = self
            .entries
            .get(key)
            .filter(|e| e.value().1 > now)
            .map(|e| e.value().0.clone());
        if hit.is_none() {
            self.entries.remove_if(key, |_, (_, expires)| *expires <= now);
        }
        Ok(hit)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.check()?;
        self.entries
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check()?;
        Ok(self.entries.remove(key).is_some())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.check()?;
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        Ok(keys
            .into_iter()
            .filter(|k| self.entries.remove(k).is_some())
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_l2_expires() {
        let l2 = MemorySharedCache::new();
        l2.set("k", b"v".to_vec(), Duration::from_millis(20)).await.unwrap();
        assert_eq!(l2.get("k").await.unwrap(), Some(b"v".to_vec()));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(l2.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_l2_unavailable() {
        let l2 = MemorySharedCache::new();
        l2.set_available(false);
        assert!(l2.get("k").await.is_err());
        assert!(l2.ping().await.is_err());
        l2.set_available(true);
        assert!(l2.ping().await.is_ok());
    }
}
