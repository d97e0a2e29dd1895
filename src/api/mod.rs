//! HTTP API
//!
//! REST read surface over the aggregation engine plus a manual refresh
//! trigger. Only compiled when the `api` feature is enabled.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::aggregator::AggregationEngine;
use crate::view::{asset_view, asset_views};

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Create the API router with all endpoints
pub fn create_router(engine: Arc<AggregationEngine>) -> Router {
    Router::new()
        .route("/api/v1/stablecoins", get(list_assets))
        .route("/api/v1/stablecoins/:id", get(get_asset))
        .route("/api/v1/platforms", get(get_platforms))
        .route("/api/v1/metrics", get(get_metrics))
        .route("/api/v1/health", get(get_health))
        .route("/api/v1/freshness", get(get_freshness))
        .route("/api/v1/refresh", post(trigger_refresh))
        .with_state(engine)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// GET /api/v1/stablecoins - All merged assets, display order
async fn list_assets(State(engine): State<Arc<AggregationEngine>>) -> impl IntoResponse {
    Json(ApiResponse::success(asset_views(&engine.stablecoins())))
}

/// GET /api/v1/stablecoins/:id - One asset by slug or symbol
async fn get_asset(
    Path(id): Path<String>,
    State(engine): State<Arc<AggregationEngine>>,
) -> impl IntoResponse {
    match engine.stablecoin(&id) {
        Some(asset) => (StatusCode::OK, Json(ApiResponse::success(asset_view(&asset)))),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("unknown asset: {id}"))),
        ),
    }
}

/// GET /api/v1/platforms - Per-network supply rollups
async fn get_platforms(State(engine): State<Arc<AggregationEngine>>) -> impl IntoResponse {
    Json(ApiResponse::success(engine.platform_data()))
}

/// GET /api/v1/metrics - Segmented market totals
async fn get_metrics(State(engine): State<Arc<AggregationEngine>>) -> impl IntoResponse {
    Json(ApiResponse::success(engine.market_metrics()))
}

/// GET /api/v1/health - System and per-source health
async fn get_health(State(engine): State<Arc<AggregationEngine>>) -> impl IntoResponse {
    #[derive(Serialize)]
    struct HealthView {
        system: crate::health::SystemHealthReport,
        sources: Vec<crate::health::SourceHealthReport>,
    }
    Json(ApiResponse::success(HealthView {
        system: engine.health_status(),
        sources: engine.health_monitor().all_source_health(),
    }))
}

/// GET /api/v1/freshness - Snapshot age and staleness
async fn get_freshness(State(engine): State<Arc<AggregationEngine>>) -> impl IntoResponse {
    Json(ApiResponse::success(engine.data_freshness()))
}

/// POST /api/v1/refresh - Trigger a refresh cycle; coalesces with any
/// cycle already in flight
async fn trigger_refresh(State(engine): State<Arc<AggregationEngine>>) -> impl IntoResponse {
    let outcome = engine.refresh().await;
    if outcome.success {
        (StatusCode::OK, Json(ApiResponse::success(outcome)))
    } else {
        (StatusCode::CONFLICT, Json(ApiResponse::success(outcome)))
    }
}
