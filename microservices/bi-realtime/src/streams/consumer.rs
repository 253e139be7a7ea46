//! Consumer-group event ingestion: one worker per stream, ack after processing

use async_trait::async_trait;
use ehub_core::{EhubError, Result};
use ehub_telemetry::Counter;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::transport::{StreamMessage, StreamTransport};
use crate::aggregation::Event;
use crate::config::ConsumerConfig;
use crate::tasks::BackgroundTasks;

/// Processes one stream entry. Returning `Err` leaves the entry
/// unacknowledged so it is redelivered after the lease expires.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, message: &StreamMessage) -> Result<()>;
}

struct StreamCounters {
    read: Counter,
    processed: Counter,
    acked: Counter,
    failed: Counter,
    dropped: Counter,
    read_errors: Counter,
    reclaimed: Counter,
}

impl StreamCounters {
    fn new(stream: &str) -> Self {
        let c = |what: &str| Counter::new(&format!("consumer_{}_{}", what, stream));
        Self {
            read: c("read"),
            processed: c("processed"),
            acked: c("acked"),
            failed: c("failed"),
            dropped: c("dropped"),
            read_errors: c("read_errors"),
            reclaimed: c("reclaimed"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub read: u64,
    pub processed: u64,
    pub acked: u64,
    pub failed: u64,
    /// Entries acknowledged without success after too many deliveries
    pub dropped: u64,
    pub read_errors: u64,
    pub reclaimed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumerStats {
    pub backend: &'static str,
    pub group: String,
    pub consumer: String,
    pub running: bool,
    pub streams: BTreeMap<String, StreamStats>,
}

struct Running {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Everything a worker needs, shared by all of them
struct Shared {
    transport: Arc<dyn StreamTransport>,
    handler: Arc<dyn EventHandler>,
    config: ConsumerConfig,
}

pub struct EventConsumer {
    shared: Arc<Shared>,
    counters: BTreeMap<String, Arc<StreamCounters>>,
    tasks: BackgroundTasks,
    running: Mutex<Option<Running>>,
}

impl EventConsumer {
    pub fn new(
        config: ConsumerConfig,
        transport: Arc<dyn StreamTransport>,
        handler: Arc<dyn EventHandler>,
        tasks: BackgroundTasks,
    ) -> Self {
        let counters = config
            .streams
            .iter()
            .map(|s| (s.clone(), Arc::new(StreamCounters::new(s))))
            .collect();
        Self {
            shared: Arc::new(Shared {
                transport,
                handler,
                config,
            }),
            counters,
            tasks,
            running: Mutex::new(None),
        }
    }

    /// Join the consumer group on every stream, then spawn one worker each.
    ///
    /// Failing to join a group is the one error surfaced to the caller.
    pub async fn start(&self, parent: &CancellationToken) -> Result<()> {
        if self.running.lock().is_some() {
            return Err(EhubError::Validation("consumer already started".into()));
        }
        let config = &self.shared.config;
        for stream in &config.streams {
            match tokio::time::timeout(
                config.call_timeout,
                self.shared.transport.ensure_group(stream, &config.group),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(stream = %stream, group = %config.group, error = %e, "Failed to join consumer group");
                    return Err(e);
                }
                Err(_) => {
                    return Err(EhubError::Timeout(format!(
                        "joining group {} on {}",
                        config.group, stream
                    )))
                }
            }
        }

        let cancel = parent.child_token();
        let handles = self
            .counters
            .iter()
            .map(|(stream, counters)| {
                let worker = Worker {
                    shared: self.shared.clone(),
                    stream: stream.clone(),
                    counters: counters.clone(),
                };
                self.tasks
                    .spawn(format!("consumer:{}", stream), worker.run(cancel.clone()))
            })
            .collect();

        info!(
            streams = config.streams.len(),
            group = %config.group,
            consumer = %config.consumer_name,
            backend = self.shared.transport.backend(),
            "Event consumer started"
        );
        *self.running.lock() = Some(Running { cancel, handles });
        Ok(())
    }

    /// Signal every worker, let in-flight batches finish, and abort whatever
    /// is still running after the grace period. Returns how many were aborted.
    pub async fn stop(&self) -> usize {
        let Some(Running { cancel, handles }) = self.running.lock().take() else {
            return 0;
        };
        cancel.cancel();

        let grace = self.shared.config.shutdown_grace;
        let deadline = tokio::time::Instant::now() + grace;
        let mut aborted = 0;
        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
                aborted += 1;
            }
        }
        if aborted > 0 {
            warn!(aborted, grace_secs = grace.as_secs(), "Force-cancelled stream workers");
        }
        info!("Event consumer stopped");
        aborted
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn stats(&self) -> ConsumerStats {
        let config = &self.shared.config;
        ConsumerStats {
            backend: self.shared.transport.backend(),
            group: config.group.clone(),
            consumer: config.consumer_name.clone(),
            running: self.is_running(),
            streams: self
                .counters
                .iter()
                .map(|(stream, c)| {
                    (
                        stream.clone(),
                        StreamStats {
                            read: c.read.get(),
                            processed: c.processed.get(),
                            acked: c.acked.get(),
                            failed: c.failed.get(),
                            dropped: c.dropped.get(),
                            read_errors: c.read_errors.get(),
                            reclaimed: c.reclaimed.get(),
                        },
                    )
                })
                .collect(),
        }
    }
}

struct Worker {
    shared: Arc<Shared>,
    stream: String,
    counters: Arc<StreamCounters>,
}

impl Worker {
    async fn run(self, cancel: CancellationToken) {
        let config = &self.shared.config;
        let mut backoff = config.backoff_initial;
        let mut last_reclaim = Instant::now();
        debug!(stream = %self.stream, "Stream worker started");

        while !cancel.is_cancelled() {
            if last_reclaim.elapsed() >= config.reclaim_interval {
                last_reclaim = Instant::now();
                self.reclaim().await;
            }

            let read = self
                .shared
                .transport
                .read_group(
                    &self.stream,
                    &config.group,
                    &config.consumer_name,
                    config.batch_size,
                    config.block,
                )
                .await;

            match read {
                Ok(batch) => {
                    backoff = config.backoff_initial;
                    if !batch.is_empty() {
                        self.counters.read.add(batch.len() as u64);
                        self.process_batch(batch).await;
                    }
                }
                Err(e) => {
                    self.counters.read_errors.inc();
                    warn!(
                        stream = %self.stream,
                        error = %e,
                        backoff_secs = backoff.as_secs_f64(),
                        "Stream read failed, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(config.backoff_max);
                }
            }
        }
        debug!(stream = %self.stream, "Stream worker exiting");
    }

    async fn reclaim(&self) {
        let config = &self.shared.config;
        match self
            .shared
            .transport
            .claim_stale(
                &self.stream,
                &config.group,
                &config.consumer_name,
                config.lease_timeout,
                config.batch_size,
            )
            .await
        {
            Ok(batch) if !batch.is_empty() => {
                info!(stream = %self.stream, count = batch.len(), "Reclaimed stale pending entries");
                self.counters.reclaimed.add(batch.len() as u64);
                self.process_batch(batch).await;
            }
            Ok(_) => {}
            Err(e) => debug!(stream = %self.stream, error = %e, "Pending reclaim failed"),
        }
    }

    async fn process_batch(&self, batch: Vec<StreamMessage>) {
        for message in batch {
            match self.shared.handler.handle(&message).await {
                Ok(()) => {
                    self.counters.processed.inc();
                    self.ack(&message).await;
                }
                Err(e) if message.delivery_count >= self.shared.config.max_deliveries => {
                    self.counters.failed.inc();
                    self.counters.dropped.inc();
                    warn!(
                        stream = %self.stream,
                        id = %message.id,
                        deliveries = message.delivery_count,
                        error = %e,
                        "Dropping entry after repeated failures"
                    );
                    self.ack(&message).await;
                }
                Err(e) => {
                    self.counters.failed.inc();
                    warn!(stream = %self.stream, id = %message.id, error = %e, "Event processing failed, leaving pending");
                }
            }
        }
    }

    async fn ack(&self, message: &StreamMessage) {
        let config = &self.shared.config;
        let ids = [message.id.clone()];
        match tokio::time::timeout(
            config.call_timeout,
            self.shared.transport.ack(&self.stream, &config.group, &ids),
        )
        .await
        {
            Ok(Ok(_)) => self.counters.acked.inc(),
            Ok(Err(e)) => warn!(stream = %self.stream, id = %message.id, error = %e, "Ack failed"),
            Err(_) => warn!(stream = %self.stream, id = %message.id, "Ack timed out"),
        }
    }
}

/// Appends events to streams
#[derive(Clone)]
pub struct EventProducer {
    transport: Arc<dyn StreamTransport>,
}

impl EventProducer {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        Self { transport }
    }

    pub async fn publish(&self, stream: &str, event: &Event) -> Result<String> {
        let payload = event.encode()?;
        self.transport.publish(stream, &payload).await
    }
}
