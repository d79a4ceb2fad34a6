//! Liveness and readiness probes.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;
use tracing::error;

use crate::http::AppState;

pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(liveness_check))
        .route("/health/live", get(liveness_check))
        .route("/health/ready", get(readiness_check))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<HealthDetails>,
}

#[derive(Debug, Serialize)]
struct HealthDetails {
    database: String,
    peers_reachable: usize,
    peers_total: usize,
}

/// Liveness: the process is up and serving.
async fn liveness_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
            details: None,
        }),
    )
}

/// Readiness: the database answers and at least one peer is reachable.
/// With every peer down there is nothing to sync against, so the instance
/// reports unready rather than silently queueing forever.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let services = &state.services;

    let database_ok = match sqlx::query("SELECT 1").execute(&services.pool).await {
        Ok(_) => true,
        Err(e) => {
            error!("database health check failed: {e}");
            false
        }
    };

    let health = services.users.health_check_all().await;
    let peers_reachable = health.values().filter(|healthy| **healthy).count();
    let peers_total = health.len();

    let ready = database_ok && peers_reachable > 0;
    let status_code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: if ready { "healthy" } else { "unhealthy" }.to_string(),
            details: Some(HealthDetails {
                database: if database_ok { "healthy" } else { "unhealthy" }.to_string(),
                peers_reachable,
                peers_total,
            }),
        }),
    )
}
