//! In-process L1 tier: bounded, strictly least-recently-used.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Entry stored in the L1 tier
#[derive(Debug, Clone)]
pub struct L1Entry {
    pub value: Value,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub hit_count: u64,
    pub last_accessed: Instant,
}

impl L1Entry {
    fn new(value: Value, ttl: Duration, now: Instant) -> Self {
        // expires_at must stay strictly after created_at
        let ttl = ttl.max(Duration::from_millis(1));
        Self {
            value,
            created_at: now,
            expires_at: now + ttl,
            hit_count: 0,
            last_accessed: now,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn ttl(&self) -> Duration {
        self.expires_at.duration_since(self.created_at)
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

struct Node {
    key: String,
    entry: L1Entry,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Slab-backed doubly linked list plus index. `head` is most recent.
struct LruMap {
    index: HashMap<String, usize>,
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl LruMap {
    fn new(capacity: usize) -> Self {
        Self {
            index: HashMap::with_capacity(capacity),
            nodes: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn node(&self, idx: usize) -> &Node {
        self.nodes[idx].as_ref().expect("linked index points at a live node")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        self.nodes[idx].as_mut().expect("linked index points at a live node")
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.node(idx);
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let node = self.node_mut(idx);
        node.prev = None;
        node.next = None;
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let node = self.node_mut(idx);
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            self.node_mut(h).prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn touch(&mut self, idx: usize) {
        if self.head != Some(idx) {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    fn insert_front(&mut self, key: String, entry: L1Entry) {
        let node = Node {
            key: key.clone(),
            entry,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.push_front(idx);
    }

    fn remove_idx(&mut self, idx: usize) -> Node {
        self.unlink(idx);
        let node = self.nodes[idx].take().expect("linked index points at a live node");
        self.index.remove(&node.key);
        self.free.push(idx);
        node
    }

    fn pop_lru(&mut self) -> Option<Node> {
        self.tail.map(|idx| self.remove_idx(idx))
    }
}

/// Thread-safe LRU wrapper.
///
/// The lock is held only for O(1) link/unlink work; nothing awaits under it.
pub struct L1Cache {
    map: Mutex<LruMap>,
    capacity: usize,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl L1Cache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            map: Mutex::new(LruMap::new(capacity)),
            capacity,
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Look up a live entry, bumping it to most-recently-used.
    ///
    /// Expired entries are dropped on sight and reported as absent.
    pub fn get(&self, key: &str, now: Instant) -> Option<L1Entry> {
        let mut map = self.map.lock();
        let idx = *map.index.get(key)?;
        if map.node(idx).entry.is_expired(now) {
            map.remove_idx(idx);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        map.touch(idx);
        let node = map.node_mut(idx);
        node.entry.hit_count += 1;
        node.entry.last_accessed = now;
        Some(node.entry.clone())
    }

    /// Metadata lookup without affecting recency or hit counts.
    pub fn peek(&self, key: &str, now: Instant) -> Option<L1Entry> {
        let map = self.map.lock();
        let idx = *map.index.get(key)?;
        let entry = &map.node(idx).entry;
        if entry.is_expired(now) {
            return None;
        }
        Some(entry.clone())
    }

    /// Insert or replace. Returns the key evicted to make room, if any.
    pub fn insert(&self, key: &str, value: Value, ttl: Duration, now: Instant) -> Option<String> {
        let mut map = self.map.lock();
        if let Some(&idx) = map.index.get(key) {
            let hits = map.node(idx).entry.hit_count;
            let node = map.node_mut(idx);
            node.entry = L1Entry::new(value, ttl, now);
            node.entry.hit_count = hits;
            map.touch(idx);
            return None;
        }

        let mut evicted = None;
        if map.len() >= self.capacity {
            if let Some(node) = map.pop_lru() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                evicted = Some(node.key);
            }
        }
        map.insert_front(key.to_string(), L1Entry::new(value, ttl, now));
        evicted
    }

    pub fn remove(&self, key: &str) -> bool {
        let mut map = self.map.lock();
        match map.index.get(key).copied() {
            Some(idx) => {
                map.remove_idx(idx);
                true
            }
            None => false,
        }
    }

    /// Remove every key starting with `prefix`, returning the removed keys.
    pub fn remove_prefix(&self, prefix: &str) -> Vec<String> {
        let mut map = self.map.lock();
        let doomed: Vec<usize> = map
            .index
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(_, &idx)| idx)
            .collect();
        doomed
            .into_iter()
            .map(|idx| map.remove_idx(idx).key)
            .collect()
    }

    /// Drop every expired entry. Returns how many were purged.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut map = self.map.lock();
        let expired: Vec<usize> = map
            .index
            .values()
            .copied()
            .filter(|&idx| map.node(idx).entry.is_expired(now))
            .collect();
        let count = expired.len();
        for idx in expired {
            map.remove_idx(idx);
        }
        self.expirations.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    /// Keys from most to least recently used.
    pub fn keys_by_recency(&self) -> Vec<String> {
        let map = self.map.lock();
        let mut keys = Vec::with_capacity(map.len());
        let mut cursor = map.head;
        while let Some(idx) = cursor {
            let node = map.node(idx);
            keys.push(node.key.clone());
            cursor = node.next;
        }
        keys
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }
}
