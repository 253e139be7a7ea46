//! Per-key request coalescing.
//!
//! The first caller for a key installs a shared future; everyone arriving
//! while it runs awaits the same future and receives the same result,
//! including its error. The entry removes itself on completion, so a failed
//! computation is never remembered.

use ehub_core::Result;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type Flight = Shared<BoxFuture<'static, Result<Value>>>;

#[derive(Default)]
pub struct SingleFlight {
    inflight: Arc<Mutex<HashMap<String, (u64, Flight)>>>,
    next_id: AtomicU64,
    leaders: AtomicU64,
    joins: AtomicU64,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` for `key` unless a computation for it is already in flight.
    ///
    /// `work` is only invoked by the leader. The returned flag is true when
    /// this caller joined an existing flight.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> (Result<Value>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let (flight, joined) = {
            let mut inflight = self.inflight.lock();
            match inflight.get(key) {
                Some((_, flight)) => (flight.clone(), true),
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let registry = Arc::clone(&self.inflight);
                    let owned_key = key.to_string();
                    let fut = work();
                    let flight = async move {
                        let result = fut.await;
                        let mut inflight = registry.lock();
                        if inflight.get(&owned_key).map(|(i, _)| *i) == Some(id) {
                            inflight.remove(&owned_key);
                        }
                        result
                    }
                    .boxed()
                    .shared();
                    inflight.insert(key.to_string(), (id, flight.clone()));
                    (flight, false)
                }
            }
        };

        if joined {
            self.joins.fetch_add(1, Ordering::Relaxed);
        } else {
            self.leaders.fetch_add(1, Ordering::Relaxed);
        }
        (flight.await, joined)
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }

    pub fn leaders(&self) -> u64 {
        self.leaders.load(Ordering::Relaxed)
    }

    pub fn joins(&self) -> u64 {
        self.joins.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ehub_core::EhubError;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_computation() {
        let flights = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let flights = flights.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                flights
                    .run("k", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(json!(42))
                    })
                    .await
                    .0
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), json!(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
        assert_eq!(flights.joins() + flights.leaders(), 16);
    }

    #[tokio::test]
    async fn test_failure_reaches_waiters_and_is_not_cached() {
        let flights = SingleFlight::new();
        let (first, _) = flights
            .run("k", || async { Err(EhubError::Compute("boom".into())) })
            .await;
        assert_eq!(first, Err(EhubError::Compute("boom".into())));

        let (second, joined) = flights.run("k", || async { Ok(json!(1)) }).await;
        assert!(!joined);
        assert_eq!(second.unwrap(), json!(1));
    }
}
