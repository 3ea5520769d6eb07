//! HTTP admin API: health, readiness, federation catalog and metrics

use crate::backend::{self, BackendRole};
use crate::federation::FederationEntry;
use crate::metrics;
use crate::router::QueryRouter;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<QueryRouter>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub production: bool,
    pub fresh: bool,
}

#[derive(Debug, Serialize)]
pub struct FederationResponse {
    pub enabled: bool,
    pub tables: Vec<FederationEntry>,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub federated_tables: usize,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/federation", get(federation))
        .route("/federation/refresh", post(refresh_federation))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

/// Health check endpoint
pub async fn health() -> &'static str {
    "OK"
}

/// Ready when both stores answer
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let (production, fresh) = tokio::join!(
        backend::ping(state.router.backend(BackendRole::Production)),
        backend::ping(state.router.backend(BackendRole::Fresh)),
    );

    let body = ReadyResponse {
        production: production.is_ok(),
        fresh: fresh.is_ok(),
    };
    if body.production && body.fresh {
        (StatusCode::OK, Json(body))
    } else {
        warn!(production = body.production, fresh = body.fresh, "Readiness check failed");
        (StatusCode::SERVICE_UNAVAILABLE, Json(body))
    }
}

/// Current federation catalog
pub async fn federation(State(state): State<AppState>) -> Json<FederationResponse> {
    let catalog = state.router.catalog().load();
    Json(FederationResponse {
        enabled: state.router.federation_enabled(),
        tables: catalog.entries().cloned().collect(),
    })
}

/// Rerun the federation bootstrap
pub async fn refresh_federation(State(state): State<AppState>) -> impl IntoResponse {
    if !state.router.federation_enabled() {
        return (
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: "federation is disabled".to_string(),
                code: "FEDERATION_DISABLED".to_string(),
            }),
        )
            .into_response();
    }

    info!("Federation refresh requested");
    match state.router.refresh_federation().await {
        Ok(federated_tables) => (StatusCode::OK, Json(RefreshResponse { federated_tables })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
                code: "BOOTSTRAP_FAILED".to_string(),
            }),
        )
            .into_response(),
    }
}

/// Prometheus metrics endpoint
pub async fn prometheus_metrics() -> impl IntoResponse {
    let body = metrics::encode_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        body,
    )
}
