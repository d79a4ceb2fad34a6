//! Webhook intake: one endpoint per source peer.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde_json::json;
use tracing::{debug, error, info, warn};

use jellysync_core::models::WebhookPayload;

use crate::http::AppState;

pub fn create_webhook_router() -> Router<AppState> {
    Router::new()
        .route("/webhook/{peer_name}", post(receive_webhook))
        .route("/webhook/test", get(test_webhook))
}

/// Receive a webhook from one peer. Each peer posts to
/// `/webhook/{peer_name}` where the name matches the configuration.
async fn receive_webhook(
    State(state): State<AppState>,
    Path(peer_name): Path<String>,
    body: String,
) -> impl IntoResponse {
    let services = &state.services;

    if services.config.get_server(&peer_name).is_none() {
        warn!(peer_name, "webhook for unknown peer");
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"detail": format!("Unknown server: {peer_name}")})),
        );
    }

    // Decoded by hand so malformed bodies are a 400, not a 422, and the
    // envelope's tolerant rules (aliases, unknown keys) apply uniformly.
    let payload: WebhookPayload = match serde_json::from_str(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(peer_name, "malformed webhook payload: {e}");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"detail": "Invalid webhook payload"})),
            );
        }
    };

    debug!(peer_name, event = %payload.event, "webhook received");

    // User lifecycle replicates inline, outside the durable queue.
    match payload.event.as_str() {
        "UserCreated" => {
            if payload.username.is_empty() || payload.user_id.is_empty() {
                return (
                    StatusCode::OK,
                    Json(json!({"status": "skipped", "reason": "missing user info"})),
                );
            }
            info!(peer_name, username = %payload.username, "UserCreated webhook");
            return match services
                .users
                .sync_user_creation(&peer_name, &payload.username, &payload.user_id)
                .await
            {
                Ok(report) => (
                    StatusCode::OK,
                    Json(json!({
                        "status": "user_synced",
                        "username": payload.username,
                        "source_server": peer_name,
                        "created": report.created,
                        "skipped": report.skipped,
                        "failed": report.failed,
                    })),
                ),
                Err(e) => internal_error(e),
            };
        }
        "UserDeleted" => {
            if payload.username.is_empty() {
                return (
                    StatusCode::OK,
                    Json(json!({"status": "skipped", "reason": "missing username"})),
                );
            }
            info!(peer_name, username = %payload.username, "UserDeleted webhook");
            return match services
                .users
                .sync_user_deletion(&peer_name, &payload.username)
                .await
            {
                Ok(report) => (
                    StatusCode::OK,
                    Json(json!({
                        "status": "user_deleted_all",
                        "username": payload.username,
                        "source_server": peer_name,
                        "deleted": report.deleted,
                        "not_found": report.not_found,
                        "failed": report.failed,
                    })),
                ),
                Err(e) => internal_error(e),
            };
        }
        _ => {}
    }

    // Playback-state events need a user to mirror for.
    if payload.username.is_empty() {
        debug!(peer_name, event = %payload.event, "skipping webhook without username");
        return (
            StatusCode::OK,
            Json(json!({"status": "skipped", "reason": "no username"})),
        );
    }

    match services.dispatcher.handle_webhook(&peer_name, &payload).await {
        Ok(enqueued) => (
            StatusCode::OK,
            Json(json!({"status": "enqueued", "events_enqueued": enqueued})),
        ),
        Err(e) => internal_error(e),
    }
}

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<serde_json::Value>) {
    error!("webhook processing failed: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"detail": "internal error"})),
    )
}

/// Liveness echo for webhook plumbing checks.
async fn test_webhook() -> impl IntoResponse {
    Json(json!({"status": "ok", "message": "Webhook receiver is running"}))
}
