//! Bounded idempotency set keyed by event id

use parking_lot::Mutex;
use std::collections::hash_map::RandomState;
use std::collections::{HashSet, VecDeque};
use std::hash::BuildHasher;
use std::time::{Duration, Instant};

const DEDUP_SHARDS: usize = 16;

/// FIFO-evicting set of recently seen ids.
///
/// Ids are forgotten after `ttl` or when `capacity` newer ids push them out,
/// whichever comes first. Every id shares one TTL, so insertion order is
/// also expiry order.
pub struct DedupSet {
    order: VecDeque<(String, Instant)>,
    seen: HashSet<String>,
    capacity: usize,
    ttl: Duration,
}

impl DedupSet {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity.min(4096)),
            seen: HashSet::with_capacity(capacity.min(4096)),
            capacity,
            ttl,
        }
    }

    /// Returns true if `id` was not seen within the retention horizon.
    pub fn insert(&mut self, id: &str, now: Instant) -> bool {
        self.expire(now);
        if self.seen.contains(id) {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some((old, _)) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        self.order.push_back((id.to_string(), now));
        self.seen.insert(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn expire(&mut self, now: Instant) {
        while let Some((_, at)) = self.order.front() {
            if now.saturating_duration_since(*at) < self.ttl {
                break;
            }
            if let Some((old, _)) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
    }
}

/// [`DedupSet`] split into independently locked shards by id hash, so
/// concurrent ingest for different events rarely contends on one lock.
///
/// Capacity is divided evenly across shards.
pub struct ShardedDedup {
    shards: Vec<Mutex<DedupSet>>,
    hasher: RandomState,
}

impl ShardedDedup {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let count = DEDUP_SHARDS.min(capacity.max(1));
        let per_shard = capacity.max(1).div_ceil(count);
        Self {
            shards: (0..count).map(|_| Mutex::new(DedupSet::new(per_shard, ttl))).collect(),
            hasher: RandomState::new(),
        }
    }

    fn shard(&self, id: &str) -> &Mutex<DedupSet> {
        let idx = self.hasher.hash_one(id) as usize % self.shards.len();
        &self.shards[idx]
    }

    pub fn insert(&self, id: &str, now: Instant) -> bool {
        self.shard(id).lock().insert(id, now)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.shard(id).lock().contains(id)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_repeats() {
        let mut set = DedupSet::new(10, Duration::from_secs(60));
        let now = Instant::now();
        assert!(set.insert("a", now));
        assert!(!set.insert("a", now));
        assert!(set.insert("b", now));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut set = DedupSet::new(2, Duration::from_secs(60));
        let now = Instant::now();
        set.insert("a", now);
        set.insert("b", now);
        set.insert("c", now);
        assert_eq!(set.len(), 2);
        assert!(!set.contains("a"));
        assert!(set.insert("a", now));
    }

    #[test]
    fn test_ttl_expires() {
        let mut set = DedupSet::new(10, Duration::from_secs(5));
        let now = Instant::now();
        set.insert("a", now);
        assert!(set.insert("a", now + Duration::from_secs(6)));
    }

    #[test]
    fn test_sharded_set_rejects_repeats_across_threads() {
        let set = std::sync::Arc::new(ShardedDedup::new(10_000, Duration::from_secs(60)));
        assert_eq!(set.shard_count(), DEDUP_SHARDS);
        let now = Instant::now();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let set = set.clone();
                std::thread::spawn(move || (0..500).filter(|i| set.insert(&format!("evt-{}", i), now)).count())
            })
            .collect();
        let accepted: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();

        assert_eq!(accepted, 500);
        assert_eq!(set.len(), 500);
        assert!(set.contains("evt-499"));
    }

    #[test]
    fn test_small_capacity_uses_fewer_shards() {
        let set = ShardedDedup::new(2, Duration::from_secs(60));
        assert_eq!(set.shard_count(), 2);
        let now = Instant::now();
        assert!(set.insert("a", now));
        assert!(!set.insert("a", now));
    }
}
