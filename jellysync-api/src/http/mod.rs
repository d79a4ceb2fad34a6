//! HTTP surface: webhook intake, status API, health probes.

pub mod health;
pub mod status;
pub mod webhook;

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tower_http::trace::TraceLayer;

use jellysync_core::bootstrap::Services;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<Services>,
    pub started_at: Instant,
}

impl AppState {
    #[must_use]
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            started_at: Instant::now(),
        }
    }
}

/// Assemble the full application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(webhook::create_webhook_router())
        .merge(status::create_status_router())
        .merge(health::create_health_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
