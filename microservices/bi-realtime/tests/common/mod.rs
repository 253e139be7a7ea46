//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bi_realtime::pubsub::SubscriberTransport;
use ehub_core::{EhubError, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

pub const START: &str = "2024-05-01T10:00:00Z";

/// Subscriber that keeps every frame it receives. Send outcomes can be
/// queued up front; `false` fails that send.
#[derive(Default)]
pub struct MockSubscriber {
    frames: Mutex<Vec<String>>,
    outcomes: Mutex<VecDeque<bool>>,
    closed: AtomicBool,
}

impl MockSubscriber {
    pub fn fail_on(&self, outcomes: &[bool]) {
        self.outcomes.lock().extend(outcomes.iter().copied());
    }

    pub fn received(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn frames(&self) -> Vec<Value> {
        self.frames
            .lock()
            .iter()
            .filter_map(|f| serde_json::from_str(f).ok())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SubscriberTransport for MockSubscriber {
    async fn send(&self, text: &str) -> Result<()> {
        if !self.outcomes.lock().pop_front().unwrap_or(true) {
            return Err(EhubError::Network("subscriber went away".into()));
        }
        self.frames.lock().push(text.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Poll `check` every 20ms for up to two seconds
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    check()
}
