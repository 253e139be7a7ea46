//! Service assembly and lifecycle

use async_trait::async_trait;
use axum::Router;
use ehub_core::{DependencyStatus, EhubService, HealthStatus, ReadinessStatus, Result};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::aggregation::{WindowAggregator, AGG_NAMESPACE};
use crate::api::{create_router, AppState};
use crate::cache::{CacheWarmer, MemorySharedCache, MultiTierCache, RedisSharedCache, SharedCache};
use crate::clock::{Clock, SystemClock};
use crate::config::BiConfig;
use crate::pubsub::{HealthState, HubNotifier, PubSubHub};
use crate::query::QueryService;
use crate::streams::{EventConsumer, MemoryStreams, RedisStreams, StreamTransport};
use crate::tasks::BackgroundTasks;

/// Shared backends the pipeline runs on
pub struct Backends {
    pub l2: Arc<dyn SharedCache>,
    pub streams: Arc<dyn StreamTransport>,
    pub clock: Arc<dyn Clock>,
}

impl Backends {
    /// Redis when `REDIS_URL` is set, in-process otherwise
    pub async fn from_config(config: &BiConfig) -> Result<Self> {
        let timeout = config.consumer.call_timeout;
        let (l2, streams): (Arc<dyn SharedCache>, Arc<dyn StreamTransport>) =
            match &config.service.redis_url {
                Some(url) => (
                    Arc::new(RedisSharedCache::connect(url, timeout).await?),
                    Arc::new(RedisStreams::connect(url, timeout).await?),
                ),
                None => {
                    info!("REDIS_URL not set, running with in-process backends");
                    (Arc::new(MemorySharedCache::new()), Arc::new(MemoryStreams::new()))
                }
            };
        Ok(Self {
            l2,
            streams,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            l2: Arc::new(MemorySharedCache::new()),
            streams: Arc::new(MemoryStreams::new()),
            clock: Arc::new(SystemClock),
        }
    }
}

pub struct BiRealtimeService {
    config: BiConfig,
    state: AppState,
    tasks: BackgroundTasks,
}

impl BiRealtimeService {
    pub fn new(config: BiConfig, backends: Backends) -> Self {
        let tasks = BackgroundTasks::new();
        let cache = MultiTierCache::new(&config.cache, backends.l2);
        let aggregator = WindowAggregator::new(config.aggregator.clone(), cache.clone(), backends.clock);
        let hub = PubSubHub::new(config.hub.clone(), tasks.clone());
        aggregator.add_listener(Arc::new(HubNotifier::new(hub.clone())));

        let query = QueryService::new(cache.clone(), aggregator.clone());
        let warmer = CacheWarmer::new(cache.clone(), config.cache.warm_interval);
        warmer.register(AGG_NAMESPACE, query.aggregate_warm_ttl(), query.aggregate_warm_fn());

        let consumer = Arc::new(EventConsumer::new(
            config.consumer.clone(),
            backends.streams,
            Arc::new(aggregator.clone()),
            tasks.clone(),
        ));

        let state = AppState {
            cache,
            aggregator,
            query,
            hub,
            warmer,
            consumer,
            started_at: Instant::now(),
        };
        Self {
            config,
            state,
            tasks,
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    /// Start every background worker under `shutdown`. Only a failure to
    /// join the consumer group is returned.
    pub async fn start_workers(&self, shutdown: &CancellationToken) -> Result<()> {
        self.state.consumer.start(shutdown).await?;

        let aggregator = self.state.aggregator.clone();
        self.tasks
            .spawn("aggregator:materializer", aggregator.run_materializer(shutdown.child_token()));

        let warmer = self.state.warmer.clone();
        self.tasks.spawn("cache:warmer", warmer.run(shutdown.child_token()));

        self.state.hub.spawn_maintenance(shutdown);
        Ok(())
    }
}

#[async_trait]
impl EhubService for BiRealtimeService {
    fn service_id(&self) -> &'static str {
        "bi-realtime"
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus {
            healthy: self.state.hub.health().status != HealthState::Unhealthy,
            service_id: self.service_id().to_string(),
            version: self.version().to_string(),
            uptime_seconds: self.state.started_at.elapsed().as_secs(),
        }
    }

    async fn ready(&self) -> ReadinessStatus {
        let started = Instant::now();
        let l2_ok = self.state.cache.ping_l2().await.is_ok();
        ReadinessStatus {
            ready: self.state.consumer.is_running(),
            dependencies: vec![DependencyStatus {
                name: format!("l2:{}", self.state.cache.l2_backend()),
                available: l2_ok,
                latency_ms: Some(started.elapsed().as_millis() as u64),
            }],
        }
    }

    async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        self.start_workers(&shutdown).await?;

        let listener = tokio::net::TcpListener::bind(&self.config.service.http_bind).await?;
        info!(http = %self.config.service.http_bind, "BI realtime listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        info!("Shutting down BI realtime");
        self.state.consumer.stop().await;
        let closed = self.state.hub.close_all().await;
        info!(closed, "Closed subscriber connections");
        Ok(())
    }
}
