//! REST handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use ehub_core::{DependencyStatus, ReadinessStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;

use super::AppState;
use crate::aggregation::{AggregateSnapshot, AggregatorStats, WindowName};
use crate::cache::CacheStats;
use crate::error::{Error, Result};
use crate::pubsub::{HealthState, HubHealth, HubStats};
use crate::streams::ConsumerStats;

#[derive(Serialize)]
pub struct HealthResponse {
    #[serde(flatten)]
    pub hub: HubHealth,
    pub service: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub consumer_running: bool,
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let mut hub = state.hub.health();
    let consumer_running = state.consumer.is_running();
    if !consumer_running && hub.status == HealthState::Healthy {
        hub.status = HealthState::Degraded;
    }
    let code = match hub.status {
        HealthState::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (
        code,
        Json(HealthResponse {
            hub,
            service: "bi-realtime",
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs: state.started_at.elapsed().as_secs(),
            consumer_running,
        }),
    )
}

pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadinessStatus>) {
    let started = Instant::now();
    let l2 = state.cache.ping_l2().await;
    let l2_status = DependencyStatus {
        name: format!("l2:{}", state.cache.l2_backend()),
        available: l2.is_ok(),
        latency_ms: Some(started.elapsed().as_millis() as u64),
    };
    let consumer_status = DependencyStatus {
        name: "stream-consumer".to_string(),
        available: state.consumer.is_running(),
        latency_ms: None,
    };
    // L2 is optional for serving; the consumer is not
    let ready = consumer_status.available;
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(ReadinessStatus {
            ready,
            dependencies: vec![l2_status, consumer_status],
        }),
    )
}

pub async fn get_aggregate(
    State(state): State<AppState>,
    Path((window, entity)): Path<(String, String)>,
) -> Result<Json<AggregateSnapshot>> {
    state
        .query
        .get_aggregate(&window, &entity)
        .await?
        .map(Json)
        .ok_or_else(|| Error::AggregateNotFound(format!("{}:{}", window, entity)))
}

pub async fn get_realtime_metrics(
    State(state): State<AppState>,
    Path(location): Path<String>,
) -> Result<Json<Value>> {
    Ok(Json(state.query.get_realtime_metrics(&location).await?))
}

#[derive(Serialize)]
pub struct AnalyticsResponse {
    pub cache: CacheStats,
    pub aggregator: AggregatorStats,
    pub consumer: ConsumerStats,
    pub hub: HubStats,
}

pub async fn cache_analytics(State(state): State<AppState>) -> Json<AnalyticsResponse> {
    Json(AnalyticsResponse {
        cache: state.cache.stats(),
        aggregator: state.aggregator.stats(),
        consumer: state.consumer.stats(),
        hub: state.hub.stats(),
    })
}

#[derive(Serialize)]
pub struct InvalidateResponse {
    pub namespace: String,
    pub removed: usize,
}

pub async fn invalidate_namespace(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
) -> Result<Json<InvalidateResponse>> {
    if namespace.trim().is_empty() {
        return Err(Error::InvalidRequest("namespace must not be empty".into()));
    }
    let removed = state.cache.invalidate_namespace(&namespace).await;
    Ok(Json(InvalidateResponse { namespace, removed }))
}

#[derive(Debug, Default, Deserialize)]
pub struct TriggerAggregationRequest {
    pub window: Option<String>,
    pub entity_key: Option<String>,
}

#[derive(Serialize)]
pub struct TriggerAggregationResponse {
    pub windows: Vec<WindowName>,
    pub materialized: usize,
}

pub async fn trigger_aggregation(
    State(state): State<AppState>,
    body: Option<Json<TriggerAggregationRequest>>,
) -> Result<Json<TriggerAggregationResponse>> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let windows = match request.window.as_deref() {
        Some(raw) => vec![raw
            .parse::<WindowName>()
            .map_err(|_| Error::UnknownWindow(raw.to_string()))?],
        None => WindowName::ALL.to_vec(),
    };

    let mut materialized = 0;
    for window in &windows {
        materialized += match request.entity_key.as_deref() {
            Some(entity) => state
                .aggregator
                .materialize_entity(*window, entity)
                .await
                .map_or(0, |_| 1),
            None => state.aggregator.materialize_window(*window).await,
        };
    }
    Ok(Json(TriggerAggregationResponse {
        windows,
        materialized,
    }))
}

#[derive(Serialize)]
pub struct WarmResponse {
    pub warmed: usize,
    pub namespaces: Vec<String>,
}

pub async fn warm_cache(State(state): State<AppState>) -> Json<WarmResponse> {
    let warmed = state.warmer.warm_cycle().await;
    Json(WarmResponse {
        warmed,
        namespaces: state.warmer.namespaces(),
    })
}
