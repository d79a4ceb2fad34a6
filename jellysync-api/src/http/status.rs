//! Read-only status API for the dashboard and operators, plus the manual
//! retry hook for failed events.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use jellysync_core::models::{PendingEvent, PendingEventStatus, SyncLogEntry, SyncStats};

use crate::http::AppState;

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn create_status_router() -> Router<AppState> {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/servers", get(get_servers))
        .route("/api/queue", get(get_queue))
        .route("/api/events/pending", get(get_pending_events))
        .route("/api/events/waiting", get(get_waiting_events))
        .route("/api/events/failed", get(get_failed_events))
        .route("/api/events/{event_id}/retry", post(retry_event))
        .route("/api/sync-log", get(get_sync_log))
        .route("/api/users", get(get_user_mappings))
}

#[derive(Debug, Serialize)]
struct ServerStatus {
    name: String,
    url: String,
    passwordless: bool,
    healthy: bool,
}

#[derive(Debug, Serialize)]
struct QueueStatus {
    pending_events: i64,
    processing_events: i64,
    waiting_for_item_events: i64,
    failed_events: i64,
    worker_running: bool,
}

#[derive(Debug, Serialize)]
struct DatabaseStatus {
    connected: bool,
    user_mappings_count: i64,
    pending_events_count: i64,
    sync_log_entries: i64,
}

#[derive(Debug, Serialize)]
struct OverallStatus {
    /// healthy, degraded or unhealthy.
    status: &'static str,
    uptime_seconds: f64,
    version: &'static str,
    servers: Vec<ServerStatus>,
    queue: QueueStatus,
    database: DatabaseStatus,
    sync_stats: SyncStats,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct PageQuery {
    limit: i64,
    offset: i64,
}

impl Default for PageQuery {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl PageQuery {
    /// Clamp to sane bounds; the views are for operators, not bulk export.
    fn clamped(&self) -> (i64, i64) {
        (self.limit.clamp(1, 500), self.offset.max(0))
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SyncLogQuery {
    limit: i64,
    since_minutes: Option<i64>,
}

impl Default for SyncLogQuery {
    fn default() -> Self {
        Self {
            limit: 100,
            since_minutes: None,
        }
    }
}

async fn get_status(State(state): State<AppState>) -> Response {
    let services = &state.services;

    let health = services.users.health_check_all().await;
    let servers: Vec<ServerStatus> = services
        .config
        .servers
        .iter()
        .map(|s| ServerStatus {
            name: s.name.clone(),
            url: s.url.clone(),
            passwordless: s.passwordless,
            healthy: health.get(&s.name).copied().unwrap_or(false),
        })
        .collect();

    let queue = match queue_status(&state).await {
        Ok(queue) => queue,
        Err(e) => return internal_error(e),
    };

    let database = match database_status(&state, &queue).await {
        Ok(database) => database,
        Err(e) => return internal_error(e),
    };

    let sync_stats = match services.sync_log.stats().await {
        Ok(stats) => stats,
        Err(e) => return internal_error(e),
    };

    let all_healthy = servers.iter().all(|s| s.healthy);
    let any_healthy = servers.iter().any(|s| s.healthy);
    let status = if all_healthy && queue.worker_running && database.connected {
        "healthy"
    } else if any_healthy && queue.worker_running && database.connected {
        "degraded"
    } else {
        "unhealthy"
    };

    ok(OverallStatus {
        status,
        uptime_seconds: state.started_at.elapsed().as_secs_f64(),
        version: VERSION,
        servers,
        queue,
        database,
        sync_stats,
    })
}

async fn get_servers(State(state): State<AppState>) -> Response {
    let services = &state.services;
    let health = services.users.health_check_all().await;

    let servers: Vec<ServerStatus> = services
        .config
        .servers
        .iter()
        .map(|s| ServerStatus {
            name: s.name.clone(),
            url: s.url.clone(),
            passwordless: s.passwordless,
            healthy: health.get(&s.name).copied().unwrap_or(false),
        })
        .collect();

    ok(servers)
}

async fn get_queue(State(state): State<AppState>) -> Response {
    match queue_status(&state).await {
        Ok(queue) => ok(queue),
        Err(e) => internal_error(e),
    }
}

async fn get_pending_events(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Response {
    list_events(&state, PendingEventStatus::Pending, &page).await
}

async fn get_waiting_events(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Response {
    list_events(&state, PendingEventStatus::WaitingForItem, &page).await
}

async fn get_failed_events(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Response {
    list_events(&state, PendingEventStatus::Failed, &page).await
}

/// Re-queue one failed event; its retry budgets start over.
async fn retry_event(State(state): State<AppState>, Path(event_id): Path<i64>) -> Response {
    match state.services.queue.reset_for_retry(event_id).await {
        Ok(true) => ok(json!({"success": true, "message": "Event queued for retry"})),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "message": "Event not found"})),
        ),
        Err(e) => internal_error(e),
    }
}

async fn get_sync_log(
    State(state): State<AppState>,
    Query(query): Query<SyncLogQuery>,
) -> Response {
    let limit = query.limit.clamp(1, 1000);
    match state
        .services
        .sync_log
        .recent(limit, query.since_minutes)
        .await
    {
        Ok(entries) => ok(entries.into_iter().map(log_view).collect::<Vec<_>>()),
        Err(e) => internal_error(e),
    }
}

/// Mappings grouped by username, with one column per configured peer.
async fn get_user_mappings(State(state): State<AppState>) -> Response {
    let services = &state.services;
    let server_names: Vec<String> = services
        .config
        .servers
        .iter()
        .map(|s| s.name.clone())
        .collect();

    let mappings = match services.mappings.list_all().await {
        Ok(mappings) => mappings,
        Err(e) => return internal_error(e),
    };

    let mut users: BTreeMap<String, BTreeMap<String, Option<String>>> = BTreeMap::new();
    for mapping in mappings {
        let row = users.entry(mapping.username.clone()).or_insert_with(|| {
            server_names
                .iter()
                .map(|name| (name.clone(), None))
                .collect()
        });
        row.insert(mapping.peer_name, Some(mapping.peer_user_id));
    }

    ok(json!({
        "servers": server_names,
        "users": users
            .into_iter()
            .map(|(username, servers)| json!({"username": username, "servers": servers}))
            .collect::<Vec<_>>(),
    }))
}

type Response = (StatusCode, Json<serde_json::Value>);

fn ok(value: impl Serialize) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => (StatusCode::OK, Json(value)),
        Err(e) => internal_error(e),
    }
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    error!("status api failure: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"detail": "internal error"})),
    )
}

async fn queue_status(state: &AppState) -> jellysync_core::Result<QueueStatus> {
    let counts = state.services.queue.counts().await?;
    Ok(QueueStatus {
        pending_events: counts.pending,
        processing_events: counts.processing,
        waiting_for_item_events: counts.waiting_for_item,
        failed_events: counts.failed,
        worker_running: state.services.worker.is_running(),
    })
}

async fn database_status(
    state: &AppState,
    queue: &QueueStatus,
) -> jellysync_core::Result<DatabaseStatus> {
    Ok(DatabaseStatus {
        connected: !state.services.pool.is_closed(),
        user_mappings_count: state.services.mappings.count().await?,
        pending_events_count: queue.pending_events,
        sync_log_entries: state.services.sync_log.count().await?,
    })
}

async fn list_events(
    state: &AppState,
    status: PendingEventStatus,
    page: &PageQuery,
) -> Response {
    let (limit, offset) = page.clamped();
    match state
        .services
        .queue
        .list_by_status(status, limit, offset)
        .await
    {
        Ok(events) => ok(events.iter().map(event_view).collect::<Vec<_>>()),
        Err(e) => internal_error(e),
    }
}

/// Row shape for the event views: queue internals the dashboard renders.
fn event_view(event: &PendingEvent) -> serde_json::Value {
    json!({
        "id": event.id,
        "event_type": event.event_type,
        "source_server": event.source_peer,
        "target_server": event.target_peer,
        "username": event.username,
        "item_name": event.item_name,
        "item_path": event.item_path,
        "status": event.status,
        "retry_count": event.retry_count,
        "item_not_found_count": event.item_not_found_count,
        "item_not_found_max": event.item_not_found_max,
        "last_error": event.last_error,
        "next_retry_at": event.next_retry_at.map(rfc3339),
        "created_at": rfc3339(event.created_at),
    })
}

fn log_view(entry: SyncLogEntry) -> serde_json::Value {
    json!({
        "id": entry.id,
        "event_type": entry.event_type,
        "source_server": entry.source_peer,
        "target_server": entry.target_peer,
        "username": entry.username,
        "item_id": entry.source_item_id,
        "item_name": entry.item_name,
        "synced_value": entry.synced_value,
        "success": entry.success,
        "message": entry.message,
        "created_at": rfc3339(entry.created_at),
    })
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
