//! HTTP surface: REST endpoints and the WebSocket bridge onto the hub

pub mod rest;
pub mod websocket;

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use std::time::Instant;

use crate::aggregation::WindowAggregator;
use crate::cache::{CacheWarmer, MultiTierCache};
use crate::pubsub::PubSubHub;
use crate::query::QueryService;
use crate::streams::EventConsumer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub cache: MultiTierCache,
    pub aggregator: WindowAggregator,
    pub query: QueryService,
    pub hub: PubSubHub,
    pub warmer: CacheWarmer,
    pub consumer: Arc<EventConsumer>,
    pub started_at: Instant,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/health", get(rest::health))
        .route("/ready", get(rest::ready))
        // Query
        .route("/api/bi/aggregates/{window}/{entity}", get(rest::get_aggregate))
        .route("/api/bi/real-time-metrics/{location}", get(rest::get_realtime_metrics))
        // Operations
        .route("/api/bi/cache-analytics", get(rest::cache_analytics))
        .route("/api/bi/cache/{namespace}", delete(rest::invalidate_namespace))
        .route("/api/bi/trigger-aggregation", post(rest::trigger_aggregation))
        .route("/api/bi/warm-cache", post(rest::warm_cache))
        // WebSocket
        .route("/ws", get(websocket::ws_handler))
        .with_state(state)
}
