//! In-process consumer-group streams for single-instance runs and tests

use async_trait::async_trait;
use ehub_core::{EhubError, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use super::transport::{StreamMessage, StreamTransport};

struct Pending {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

#[derive(Default)]
struct Group {
    /// Index into `entries` of the next never-delivered entry
    next: usize,
    pending: BTreeMap<u64, Pending>,
}

#[derive(Default)]
struct Stream {
    entries: Vec<(u64, Vec<u8>)>,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
pub struct MemoryStreams {
    streams: Mutex<HashMap<String, Stream>>,
    next_seq: Mutex<u64>,
    notify: Notify,
    unavailable: AtomicBool,
}

fn format_id(seq: u64) -> String {
    format!("{}-0", seq)
}

fn parse_id(id: &str) -> Option<u64> {
    id.split('-').next()?.parse().ok()
}

impl MemoryStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the transport going away; every call fails while unavailable.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.streams
            .lock()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    pub fn len(&self, stream: &str) -> usize {
        self.streams
            .lock()
            .get(stream)
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EhubError::Network("memory streams marked unavailable".into()));
        }
        Ok(())
    }

    fn take_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>> {
        let mut streams = self.streams.lock();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| EhubError::NotFound(format!("stream {}", stream)))?;
        let Stream { entries, groups } = state;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| EhubError::NotFound(format!("group {} on {}", group, stream)))?;

        let now = Instant::now();
        let end = (group_state.next + count).min(entries.len());
        let batch: Vec<StreamMessage> = entries[group_state.next..end]
            .iter()
            .map(|(seq, payload)| {
                group_state.pending.insert(
                    *seq,
                    Pending {
                        consumer: consumer.to_string(),
                        delivered_at: now,
                        deliveries: 1,
                    },
                );
                StreamMessage {
                    stream: stream.to_string(),
                    id: format_id(*seq),
                    payload: payload.clone(),
                    delivery_count: 1,
                }
            })
            .collect();
        group_state.next = end;
        Ok(batch)
    }
}

#[async_trait]
impl StreamTransport for MemoryStreams {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        self.check()?;
        self.streams
            .lock()
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>> {
        let deadline = Instant::now() + block;
        loop {
            self.check()?;
            // register interest before looking so a publish in between is not missed
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take_new(stream, group, consumer, count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64> {
        self.check()?;
        let mut streams = self.streams.lock();
        let Some(group_state) = streams.get_mut(stream).and_then(|s| s.groups.get_mut(group)) else {
            return Ok(0);
        };
        Ok(ids
            .iter()
            .filter_map(|id| parse_id(id))
            .filter(|seq| group_state.pending.remove(seq).is_some())
            .count() as u64)
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamMessage>> {
        self.check()?;
        let mut streams = self.streams.lock();
        let Some(state) = streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Stream { entries, groups } = state;
        let Some(group_state) = groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let mut claimed = Vec::new();
        for (seq, pending) in group_state.pending.iter_mut() {
            if claimed.len() >= count {
                break;
            }
            if now.saturating_duration_since(pending.delivered_at) < min_idle {
                continue;
            }
            let Some((_, payload)) = entries.iter().find(|(s, _)| s == seq) else {
                continue;
            };
            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            pending.deliveries += 1;
            claimed.push(StreamMessage {
                stream: stream.to_string(),
                id: format_id(*seq),
                payload: payload.clone(),
                delivery_count: pending.deliveries,
            });
        }
        Ok(claimed)
    }

    async fn publish(&self, stream: &str, payload: &[u8]) -> Result<String> {
        self.check()?;
        let seq = {
            let mut next = self.next_seq.lock();
            *next += 1;
            *next
        };
        self.streams
            .lock()
            .entry(stream.to_string())
            .or_default()
            .entries
            .push((seq, payload.to_vec()));
        self.notify.notify_waiters();
        Ok(format_id(seq))
    }
}
