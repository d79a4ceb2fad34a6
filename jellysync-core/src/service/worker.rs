use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::SecondsFormat;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::models::{EventData, PendingEvent, SyncEventType};
use crate::peer::{PeerClient, PeerError, UserDataDto, UserDataUpdate};
use crate::repository::{PendingEventRepository, UserMappingRepository};
use crate::service::cooldown::{item_identity_key, CooldownTracker};
use crate::service::item_resolver::ItemResolver;
use crate::service::peers::PeerRegistry;
use crate::{Error, Result};

/// Upper bound on concurrently in-flight mirror writes.
pub const DEFAULT_MAX_CONCURRENT: usize = 5;

/// Batch sizes per tick.
const PENDING_CLAIM_LIMIT: i64 = 100;
const WAITING_CLAIM_LIMIT: i64 = 50;

/// `processing` rows older than this are assumed orphaned by a dead worker.
const STALE_PROCESSING_MINUTES: i64 = 5;

/// Terminal result of processing one queue row.
enum Outcome {
    /// Mirror write done (or provably unnecessary); row can be deleted.
    Completed { synced_value: Option<String> },
    /// Row was parked in `waiting_for_item`; nothing more to do this round.
    Waiting,
    /// Policy-denied or exhausted item absence; row goes to `failed`.
    PermanentFailure { message: String },
}

/// Consumer side of the pipeline: drains the durable queue on a fixed
/// cadence and applies each event to its target peer.
pub struct SyncWorker {
    ctx: Arc<WorkerContext>,
    running: Arc<AtomicBool>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

struct WorkerContext {
    config: Arc<Config>,
    peers: Arc<PeerRegistry>,
    queue: PendingEventRepository,
    mappings: UserMappingRepository,
    resolver: ItemResolver,
    cooldowns: Arc<CooldownTracker>,
    semaphore: Semaphore,
}

impl SyncWorker {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        peers: Arc<PeerRegistry>,
        queue: PendingEventRepository,
        mappings: UserMappingRepository,
        resolver: ItemResolver,
        cooldowns: Arc<CooldownTracker>,
    ) -> Self {
        Self {
            ctx: Arc::new(WorkerContext {
                config,
                peers,
                queue,
                mappings,
                resolver,
                cooldowns,
                semaphore: Semaphore::new(DEFAULT_MAX_CONCURRENT),
            }),
            running: Arc::new(AtomicBool::new(false)),
            handle: parking_lot::Mutex::new(None),
        }
    }

    /// Spawn the background loop. Idempotent: a second start is a no-op
    /// while the loop is alive.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let ctx = self.ctx.clone();
        let running = self.running.clone();
        let interval = Duration::from_secs_f64(ctx.config.sync.worker_interval_seconds.max(0.1));

        let handle = tokio::spawn(async move {
            info!("sync worker started");
            while running.load(Ordering::SeqCst) {
                if let Err(e) = ctx.tick().await {
                    error!("worker tick failed: {e}");
                }
                tokio::time::sleep(interval).await;
            }
            info!("sync worker stopped");
        });

        *self.handle.lock() = Some(handle);
    }

    /// Cooperative stop: flag the loop down, cancel it, await termination.
    /// Rows interrupted mid-flight are recovered by the stale/startup
    /// processing resets.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One queue drain round; exposed so tests and callers can run the
    /// pipeline without the timer loop.
    pub async fn run_once(&self) -> Result<usize> {
        self.ctx.tick().await
    }
}

impl WorkerContext {
    async fn tick(&self) -> Result<usize> {
        let reset = self.queue.reset_stale_processing(STALE_PROCESSING_MINUTES).await?;
        if reset > 0 {
            warn!(reset, "reset stale processing events");
        }

        let pending = self.queue.claim_pending(PENDING_CLAIM_LIMIT).await?;
        let waiting = self.queue.claim_waiting(WAITING_CLAIM_LIMIT).await?;
        let total = pending.len() + waiting.len();

        let work = pending
            .into_iter()
            .chain(waiting)
            .map(|event| async move {
                // Semaphore bounds in-flight peer mutations; claimed rows
                // queue here rather than in the database.
                match self.semaphore.acquire().await {
                    Ok(_permit) => self.handle_event(event).await,
                    Err(_) => {}
                }
            });
        futures::future::join_all(work).await;

        Ok(total)
    }

    async fn handle_event(&self, event: PendingEvent) {
        let id = event.id;
        match self.process_event(&event).await {
            Ok(Outcome::Completed { synced_value }) => {
                debug!(
                    id,
                    event_type = %event.event_type,
                    target = %event.target_peer,
                    synced_value = ?synced_value,
                    "event synced"
                );
                if let Err(e) = self.queue.complete(id, synced_value.as_deref()).await {
                    error!(id, "failed to complete queue row: {e}");
                }
            }
            Ok(Outcome::Waiting) => {
                debug!(id, target = %event.target_peer, "event waiting for item import");
            }
            Ok(Outcome::PermanentFailure { message }) => {
                warn!(id, target = %event.target_peer, "event failed permanently: {message}");
                if let Err(e) = self.queue.mark_failed(id, &message).await {
                    error!(id, "failed to mark queue row failed: {e}");
                }
            }
            Err(err) => {
                warn!(id, target = %event.target_peer, "event sync failed: {err}");
                if let Err(e) = self.queue.fail(id, &err.to_string()).await {
                    error!(id, "failed to record queue row failure: {e}");
                }
            }
        }
    }

    async fn process_event(&self, event: &PendingEvent) -> Result<Outcome> {
        let peer = self.peers.get(&event.target_peer).ok_or_else(|| {
            Error::Config(format!(
                "target peer '{}' is not configured",
                event.target_peer
            ))
        })?;

        let target_user_id = self.resolve_target_user(&peer, event).await?;

        let resolved = self
            .resolver
            .resolve(
                &peer,
                event.item_path.as_deref(),
                event.provider_imdb.as_deref(),
                event.provider_tmdb.as_deref(),
                event.provider_tvdb.as_deref(),
            )
            .await?;
        let Some(item) = resolved else {
            return self.handle_item_not_found(event).await;
        };

        let data: EventData = event
            .data()
            .map_err(|e| Error::Internal(format!("corrupt event data: {e}")))?;

        // Read-before-write: a target that already matches turns the event
        // into a logged no-op. Progress is exempt so rewinds propagate.
        if event.event_type != SyncEventType::Progress {
            let user_data = peer.get_user_data(&target_user_id, &item.item_id).await?;
            if let Some(synced_value) = smart_sync_skip(event.event_type, &data, &user_data) {
                debug!(
                    id = event.id,
                    target = %event.target_peer,
                    "{synced_value}, skipping write"
                );
                self.set_cooldown(event);
                return Ok(Outcome::Completed {
                    synced_value: Some(synced_value),
                });
            }
        }

        if self.config.sync.dry_run {
            info!(
                id = event.id,
                event_type = %event.event_type,
                target = %event.target_peer,
                user = %event.username,
                item = %event.item_name,
                "dry run: skipping peer mutation"
            );
            self.set_cooldown(event);
            return Ok(Outcome::Completed {
                synced_value: Some("dry run (no write performed)".to_string()),
            });
        }

        match self
            .execute_mutation(&peer, &target_user_id, &item.item_id, event.event_type, &data)
            .await
        {
            Ok(synced_value) => {
                self.set_cooldown(event);
                Ok(Outcome::Completed {
                    synced_value: Some(synced_value),
                })
            }
            Err(PeerError::NotFound) => {
                // The id we used is gone from the peer, most likely a stale
                // cache entry. Invalidate and let the retry re-resolve.
                if item.from_cache {
                    if let Some(path) = event.item_path.as_deref() {
                        self.resolver.invalidate(peer.name(), path).await?;
                    }
                }
                Err(Error::Internal(format!(
                    "peer {} returned 404 for item id {} (stale cache entry)",
                    event.target_peer, item.item_id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn resolve_target_user(
        &self,
        peer: &PeerClient,
        event: &PendingEvent,
    ) -> Result<String> {
        if let Some(mapping) = self.mappings.get(&event.username, &event.target_peer).await? {
            return Ok(mapping.peer_user_id);
        }

        if let Some(user) = peer.get_user_by_name(&event.username).await? {
            self.mappings
                .upsert(&event.username, &event.target_peer, &user.id)
                .await?;
            return Ok(user.id);
        }

        Err(Error::NotFound(format!(
            "user '{}' not found on {}",
            event.username, event.target_peer
        )))
    }

    /// Path-policy branch for items the target has not imported yet.
    /// Waiting is deliberately not an error so it never consumes the
    /// transient retry budget.
    async fn handle_item_not_found(&self, event: &PendingEvent) -> Result<Outcome> {
        let error_msg = format!(
            "item '{}' not found on {}",
            event.item_name, event.target_peer
        );

        let Some(policy) = self.config.path_policy_for(event.item_path.as_deref()) else {
            return Ok(Outcome::PermanentFailure { message: error_msg });
        };
        if policy.absent_retry_count == 0 {
            return Ok(Outcome::PermanentFailure { message: error_msg });
        }

        let attempt = event.item_not_found_count + 1;
        if policy.absent_retry_count != -1 && attempt >= policy.absent_retry_count {
            return Ok(Outcome::PermanentFailure {
                message: format!("{error_msg} (gave up after {attempt} attempts)"),
            });
        }

        let max_display = if policy.absent_retry_count == -1 {
            "∞".to_string()
        } else {
            policy.absent_retry_count.to_string()
        };
        self.queue
            .mark_waiting_for_item(
                event.id,
                policy.absent_retry_count,
                policy.retry_delay_seconds,
                &format!("{error_msg} (attempt {attempt}/{max_display})"),
            )
            .await?;

        info!(
            id = event.id,
            item = %event.item_name,
            target = %event.target_peer,
            attempt,
            "item not found, waiting for import"
        );
        Ok(Outcome::Waiting)
    }

    async fn execute_mutation(
        &self,
        peer: &PeerClient,
        user_id: &str,
        item_id: &str,
        event_type: SyncEventType,
        data: &EventData,
    ) -> std::result::Result<String, PeerError> {
        let missing =
            |field: &str| PeerError::Parse(format!("event data missing '{field}' field"));

        match event_type {
            SyncEventType::Progress => {
                let ticks = data.position_ticks.ok_or_else(|| missing("position_ticks"))?;
                peer.set_playback_position(user_id, item_id, ticks).await?;
                Ok(format!("position_ticks={ticks}"))
            }
            SyncEventType::Watched => {
                let is_played = data.is_played.ok_or_else(|| missing("is_played"))?;
                if is_played {
                    peer.mark_played(user_id, item_id).await?;
                } else {
                    peer.mark_unplayed(user_id, item_id).await?;
                }
                Ok(format!("played={is_played}"))
            }
            SyncEventType::Favorite => {
                let is_favorite = data.is_favorite.ok_or_else(|| missing("is_favorite"))?;
                if is_favorite {
                    peer.add_favorite(user_id, item_id).await?;
                } else {
                    peer.remove_favorite(user_id, item_id).await?;
                }
                Ok(format!("favorite={is_favorite}"))
            }
            SyncEventType::Rating => match data.rating {
                Some(rating) => {
                    peer.set_rating(user_id, item_id, rating).await?;
                    Ok(format!("rating={rating}"))
                }
                None => {
                    peer.delete_rating(user_id, item_id).await?;
                    Ok("rating=removed".to_string())
                }
            },
            SyncEventType::Likes => {
                let likes = data.likes.ok_or_else(|| missing("likes"))?;
                peer.update_user_data(
                    user_id,
                    item_id,
                    &UserDataUpdate {
                        likes: Some(likes),
                        ..UserDataUpdate::default()
                    },
                )
                .await?;
                Ok(format!("likes={likes}"))
            }
            SyncEventType::PlayCount => {
                let play_count = data.play_count.ok_or_else(|| missing("play_count"))?;
                peer.update_user_data(
                    user_id,
                    item_id,
                    &UserDataUpdate {
                        play_count: Some(play_count),
                        ..UserDataUpdate::default()
                    },
                )
                .await?;
                Ok(format!("play_count={play_count}"))
            }
            SyncEventType::LastPlayed => {
                let last_played = data.last_played.ok_or_else(|| missing("last_played"))?;
                peer.update_user_data(
                    user_id,
                    item_id,
                    &UserDataUpdate {
                        last_played_date: Some(last_played),
                        ..UserDataUpdate::default()
                    },
                )
                .await?;
                Ok(format!(
                    "last_played={}",
                    last_played.to_rfc3339_opts(SecondsFormat::Secs, true)
                ))
            }
            SyncEventType::AudioStream => {
                let index = data
                    .audio_stream_index
                    .ok_or_else(|| missing("audio_stream_index"))?;
                peer.update_user_data(
                    user_id,
                    item_id,
                    &UserDataUpdate {
                        audio_stream_index: Some(index),
                        ..UserDataUpdate::default()
                    },
                )
                .await?;
                Ok(format!("audio_stream_index={index}"))
            }
            SyncEventType::SubtitleStream => {
                let index = data
                    .subtitle_stream_index
                    .ok_or_else(|| missing("subtitle_stream_index"))?;
                peer.update_user_data(
                    user_id,
                    item_id,
                    &UserDataUpdate {
                        subtitle_stream_index: Some(index),
                        ..UserDataUpdate::default()
                    },
                )
                .await?;
                Ok(format!("subtitle_stream_index={index}"))
            }
        }
    }

    fn set_cooldown(&self, event: &PendingEvent) {
        let identity = item_identity_key(
            event.item_path.as_deref(),
            event.provider_imdb.as_deref(),
            event.provider_tmdb.as_deref(),
            event.provider_tvdb.as_deref(),
        );
        self.cooldowns
            .set(&event.target_peer, &event.username, &identity, event.event_type);
    }
}

/// Smart-sync comparison: `Some(reason)` when the target already holds the
/// desired state and the write can be skipped.
fn smart_sync_skip(
    event_type: SyncEventType,
    data: &EventData,
    target: &UserDataDto,
) -> Option<String> {
    match event_type {
        // Rewinds are legitimate; progress always writes.
        SyncEventType::Progress => None,
        SyncEventType::Watched => {
            let desired = data.is_played?;
            (target.played.unwrap_or(false) == desired)
                .then(|| format!("played={desired} (already set)"))
        }
        SyncEventType::Favorite => {
            let desired = data.is_favorite?;
            (target.is_favorite.unwrap_or(false) == desired)
                .then(|| format!("favorite={desired} (already set)"))
        }
        SyncEventType::Likes => {
            let desired = data.likes?;
            (target.likes == Some(desired)).then(|| format!("likes={desired} (already set)"))
        }
        SyncEventType::Rating => {
            // The peer keeps a thumb, so equality is judged on the thumb the
            // rating maps to.
            let desired = data.rating?;
            (target.likes == Some(desired >= 5.0))
                .then(|| format!("rating={desired} (already set)"))
        }
        SyncEventType::PlayCount => {
            // Monotonic: never lower a peer's play count.
            let desired = data.play_count?;
            let current = target.play_count.unwrap_or(0);
            (current >= desired).then(|| format!("play_count={current} (target >= source)"))
        }
        SyncEventType::LastPlayed => {
            // Monotonic: never move last-played backwards.
            let desired = data.last_played?;
            let current = target.last_played_date?;
            (current >= desired).then(|| {
                format!(
                    "last_played={} (target >= source)",
                    current.to_rfc3339_opts(SecondsFormat::Secs, true)
                )
            })
        }
        SyncEventType::AudioStream => {
            let desired = data.audio_stream_index?;
            (target.audio_stream_index == Some(desired))
                .then(|| format!("audio_stream_index={desired} (already set)"))
        }
        SyncEventType::SubtitleStream => {
            let desired = data.subtitle_stream_index?;
            (target.subtitle_stream_index == Some(desired))
                .then(|| format!("subtitle_stream_index={desired} (already set)"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PathSyncPolicy, PeerConfig, SyncConfig};
    use crate::models::{NewPendingEvent, PendingEventStatus};
    use crate::repository::ItemPathCacheRepository;
    use crate::test_support::memory_pool;
    use chrono::{TimeZone, Utc};
    use sqlx::SqlitePool;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        worker: SyncWorker,
        queue: PendingEventRepository,
        cooldowns: Arc<CooldownTracker>,
        pool: SqlitePool,
    }

    async fn harness(server: &MockServer, mutate_config: impl FnOnce(&mut Config)) -> Harness {
        let mut config = Config {
            servers: vec![
                PeerConfig {
                    name: "wan".to_string(),
                    url: "http://wan.invalid:8096".to_string(),
                    api_key: "k1".to_string(),
                    passwordless: false,
                },
                PeerConfig {
                    name: "lan".to_string(),
                    url: server.uri(),
                    api_key: "k2".to_string(),
                    passwordless: false,
                },
            ],
            sync: SyncConfig::default(),
            ..Config::default()
        };
        mutate_config(&mut config);
        let config = Arc::new(config);

        let pool = memory_pool().await;
        let queue = PendingEventRepository::new(pool.clone());
        let mappings = UserMappingRepository::new(pool.clone());
        let resolver = ItemResolver::new(ItemPathCacheRepository::new(pool.clone()));
        let cooldowns = Arc::new(CooldownTracker::default());
        let peers = Arc::new(PeerRegistry::from_config(&config).expect("registry"));

        let worker = SyncWorker::new(
            config,
            peers,
            queue.clone(),
            mappings,
            resolver,
            cooldowns.clone(),
        );
        Harness {
            worker,
            queue,
            cooldowns,
            pool,
        }
    }

    fn watched_event() -> NewPendingEvent {
        NewPendingEvent {
            event_type: SyncEventType::Watched,
            source_peer: "wan".to_string(),
            target_peer: "lan".to_string(),
            username: "alice".to_string(),
            source_user_id: "u-wan-1".to_string(),
            source_item_id: "wan-item-1".to_string(),
            item_name: "Test Movie".to_string(),
            item_path: Some("/movies/test.mkv".to_string()),
            provider_imdb: Some("tt1234567".to_string()),
            provider_tmdb: None,
            provider_tvdb: None,
            event_data: r#"{"is_played":true}"#.to_string(),
            max_retries: 5,
        }
    }

    fn mount_users(server: &MockServer) -> Mock {
        Mock::given(method("GET"))
            .and(path("/Users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"Id": "u-admin", "Name": "Admin", "Policy": {"IsAdministrator": true}},
                {"Id": "u-alice", "Name": "Alice", "Policy": {"IsAdministrator": false}}
            ])))
    }

    fn mount_library(server: &MockServer) -> Mock {
        Mock::given(method("GET"))
            .and(path("/Users/u-admin/Items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Items": [
                    {"Id": "lan-item-1", "Name": "Test Movie", "Type": "Movie", "Path": "/movies/test.mkv"}
                ],
                "TotalRecordCount": 1
            })))
    }

    fn mount_user_data(server: &MockServer, user_data: serde_json::Value) -> Mock {
        Mock::given(method("GET"))
            .and(path("/Users/u-alice/Items/lan-item-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Id": "lan-item-1",
                "Name": "Test Movie",
                "Type": "Movie",
                "UserData": user_data
            })))
    }

    #[tokio::test]
    async fn syncs_watched_event_end_to_end() {
        let server = MockServer::start().await;
        mount_users(&server).mount(&server).await;
        mount_library(&server).mount(&server).await;
        mount_user_data(&server, serde_json::json!({"Played": false})).mount(&server).await;
        Mock::given(method("POST"))
            .and(path("/Users/u-alice/PlayedItems/lan-item-1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server, |_| {}).await;
        let id = h.queue.enqueue(&watched_event()).await.expect("enqueue").expect("row");

        let processed = h.worker.run_once().await.expect("tick");
        assert_eq!(processed, 1);

        // Row deleted, success logged, cooldown armed against the echo.
        assert!(h.queue.get(id).await.expect("get").is_none());
        let log = crate::repository::SyncLogRepository::new(h.pool.clone());
        let entries = log.recent(10, None).await.expect("log");
        assert_eq!(entries.len(), 1);
        assert!(entries[0].success);
        assert_eq!(entries[0].synced_value.as_deref(), Some("played=true"));
        assert!(h.cooldowns.is_suppressed(
            "lan",
            "alice",
            "path:/movies/test.mkv",
            SyncEventType::Watched
        ));
    }

    #[tokio::test]
    async fn smart_sync_skips_matching_state_without_writing() {
        let server = MockServer::start().await;
        mount_users(&server).mount(&server).await;
        mount_library(&server).mount(&server).await;
        mount_user_data(&server, serde_json::json!({"Played": true})).mount(&server).await;
        // No PlayedItems mock mounted: a mutation would fail the test.

        let h = harness(&server, |_| {}).await;
        let id = h.queue.enqueue(&watched_event()).await.expect("enqueue").expect("row");
        h.worker.run_once().await.expect("tick");

        assert!(h.queue.get(id).await.expect("get").is_none());
        let log = crate::repository::SyncLogRepository::new(h.pool.clone());
        let entries = log.recent(10, None).await.expect("log");
        assert!(entries[0].success);
        assert_eq!(
            entries[0].synced_value.as_deref(),
            Some("played=true (already set)")
        );
    }

    #[tokio::test]
    async fn missing_item_with_unbounded_policy_waits() {
        let server = MockServer::start().await;
        mount_users(&server).mount(&server).await;
        // Library has nothing under /movies/new.
        Mock::given(method("GET"))
            .and(path("/Users/u-admin/Items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Items": [], "TotalRecordCount": 0
            })))
            .mount(&server)
            .await;

        let h = harness(&server, |config| {
            config.path_sync_policy = vec![PathSyncPolicy {
                prefix: "/movies/new".to_string(),
                absent_retry_count: -1,
                retry_delay_seconds: 300,
            }];
        })
        .await;

        let mut event = watched_event();
        event.item_path = Some("/movies/new/latest.mkv".to_string());
        event.provider_imdb = None;
        let id = h.queue.enqueue(&event).await.expect("enqueue").expect("row");

        h.worker.run_once().await.expect("tick");

        let row = h.queue.get(id).await.expect("get").expect("row");
        assert_eq!(row.status, PendingEventStatus::WaitingForItem);
        assert_eq!(row.item_not_found_count, 1);
        assert_eq!(row.item_not_found_max, -1);
        assert_eq!(row.retry_count, 0, "waiting must not consume retries");
        let delay = (row.next_retry_at.expect("next retry") - Utc::now()).num_seconds();
        assert!((295..=300).contains(&delay));

        // Simulate many more not-found rounds: unbounded policy never fails.
        for attempt in 2..=6 {
            sqlx::query("UPDATE pending_events SET next_retry_at = NULL WHERE id = ?")
                .bind(id)
                .execute(&h.pool)
                .await
                .expect("force due");
            h.worker.run_once().await.expect("tick");
            let row = h.queue.get(id).await.expect("get").expect("row");
            assert_eq!(row.status, PendingEventStatus::WaitingForItem);
            assert_eq!(row.item_not_found_count, attempt);
        }
    }

    #[tokio::test]
    async fn missing_item_without_policy_fails_permanently() {
        let server = MockServer::start().await;
        mount_users(&server).mount(&server).await;
        Mock::given(method("GET"))
            .and(path("/Users/u-admin/Items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Items": [], "TotalRecordCount": 0
            })))
            .mount(&server)
            .await;

        let h = harness(&server, |_| {}).await;
        let mut event = watched_event();
        event.provider_imdb = None;
        let id = h.queue.enqueue(&event).await.expect("enqueue").expect("row");

        h.worker.run_once().await.expect("tick");

        let row = h.queue.get(id).await.expect("get").expect("row");
        assert_eq!(row.status, PendingEventStatus::Failed);
        assert!(row.last_error.expect("error").contains("not found on lan"));

        let log = crate::repository::SyncLogRepository::new(h.pool.clone());
        let entries = log.recent(10, None).await.expect("log");
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].success);
    }

    #[tokio::test]
    async fn bounded_policy_gives_up_after_configured_attempts() {
        let server = MockServer::start().await;
        mount_users(&server).mount(&server).await;
        Mock::given(method("GET"))
            .and(path("/Users/u-admin/Items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Items": [], "TotalRecordCount": 0
            })))
            .mount(&server)
            .await;

        let h = harness(&server, |config| {
            config.path_sync_policy = vec![PathSyncPolicy {
                prefix: "/movies".to_string(),
                absent_retry_count: 2,
                retry_delay_seconds: 60,
            }];
        })
        .await;
        let mut event = watched_event();
        event.provider_imdb = None;
        let id = h.queue.enqueue(&event).await.expect("enqueue").expect("row");

        // Attempt 1: parked.
        h.worker.run_once().await.expect("tick");
        let row = h.queue.get(id).await.expect("get").expect("row");
        assert_eq!(row.status, PendingEventStatus::WaitingForItem);

        // Attempt 2 reaches the bound: permanent failure.
        sqlx::query("UPDATE pending_events SET next_retry_at = NULL WHERE id = ?")
            .bind(id)
            .execute(&h.pool)
            .await
            .expect("force due");
        h.worker.run_once().await.expect("tick");
        let row = h.queue.get(id).await.expect("get").expect("row");
        assert_eq!(row.status, PendingEventStatus::Failed);
        assert!(row
            .last_error
            .expect("error")
            .contains("gave up after 2 attempts"));
    }

    #[tokio::test]
    async fn unknown_user_counts_against_transient_retries() {
        let server = MockServer::start().await;
        // No "alice" on this peer.
        Mock::given(method("GET"))
            .and(path("/Users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"Id": "u-admin", "Name": "Admin", "Policy": {"IsAdministrator": true}}
            ])))
            .mount(&server)
            .await;

        let h = harness(&server, |_| {}).await;
        let id = h.queue.enqueue(&watched_event()).await.expect("enqueue").expect("row");

        h.worker.run_once().await.expect("tick");

        let row = h.queue.get(id).await.expect("get").expect("row");
        assert_eq!(row.status, PendingEventStatus::Pending);
        assert_eq!(row.retry_count, 1);
        assert!(row.last_error.expect("error").contains("user 'alice' not found"));
        assert!(row.next_retry_at.is_some());
    }

    #[tokio::test]
    async fn transport_errors_back_off_and_retry() {
        let server = MockServer::start().await;
        mount_users(&server).mount(&server).await;
        mount_library(&server).mount(&server).await;
        mount_user_data(&server, serde_json::json!({"Played": false})).mount(&server).await;
        Mock::given(method("POST"))
            .and(path("/Users/u-alice/PlayedItems/lan-item-1"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let h = harness(&server, |_| {}).await;
        let id = h.queue.enqueue(&watched_event()).await.expect("enqueue").expect("row");
        h.worker.run_once().await.expect("tick");

        let row = h.queue.get(id).await.expect("get").expect("row");
        assert_eq!(row.status, PendingEventStatus::Pending);
        assert_eq!(row.retry_count, 1);
        assert!(row.last_error.expect("error").contains("HTTP 500"));
    }

    #[tokio::test]
    async fn stale_cached_id_is_invalidated_and_treated_as_transient() {
        let server = MockServer::start().await;
        mount_users(&server).mount(&server).await;
        // Cache verification succeeds (metadata fetch in admin context)...
        Mock::given(method("GET"))
            .and(path("/Users/u-admin/Items/stale-id"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Id": "stale-id", "Name": "Test Movie", "Type": "Movie"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/Users/u-alice/Items/stale-id"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Id": "stale-id", "Name": "Test Movie", "Type": "Movie",
                "UserData": {"Played": false}
            })))
            .mount(&server)
            .await;
        // ...but the mutation 404s: the id no longer exists.
        Mock::given(method("POST"))
            .and(path("/Users/u-alice/PlayedItems/stale-id"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let h = harness(&server, |_| {}).await;
        let cache = ItemPathCacheRepository::new(h.pool.clone());
        cache
            .put("lan", "/movies/test.mkv", "stale-id", None)
            .await
            .expect("seed cache");

        let id = h.queue.enqueue(&watched_event()).await.expect("enqueue").expect("row");
        h.worker.run_once().await.expect("tick");

        // Normal transient failure, not the not-found policy branch.
        let row = h.queue.get(id).await.expect("get").expect("row");
        assert_eq!(row.status, PendingEventStatus::Pending);
        assert_eq!(row.retry_count, 1);
        assert_eq!(row.item_not_found_count, 0);

        // The stale entry is gone.
        assert!(cache
            .get("lan", "/movies/test.mkv")
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn dry_run_completes_without_mutation() {
        let server = MockServer::start().await;
        mount_users(&server).mount(&server).await;
        mount_library(&server).mount(&server).await;
        mount_user_data(&server, serde_json::json!({"Played": false})).mount(&server).await;
        // No mutation endpoint mounted.

        let h = harness(&server, |config| {
            config.sync.dry_run = true;
        })
        .await;
        let id = h.queue.enqueue(&watched_event()).await.expect("enqueue").expect("row");
        h.worker.run_once().await.expect("tick");

        assert!(h.queue.get(id).await.expect("get").is_none());
        // Cooldown is armed just like a real write.
        assert!(h.cooldowns.is_suppressed(
            "lan",
            "alice",
            "path:/movies/test.mkv",
            SyncEventType::Watched
        ));
    }

    #[tokio::test]
    async fn monotonic_play_count_never_decreases() {
        let server = MockServer::start().await;
        mount_users(&server).mount(&server).await;
        mount_library(&server).mount(&server).await;
        mount_user_data(&server, serde_json::json!({"PlayCount": 7})).mount(&server).await;

        let h = harness(&server, |_| {}).await;
        let mut event = watched_event();
        event.event_type = SyncEventType::PlayCount;
        event.event_data = r#"{"play_count":3}"#.to_string();
        let id = h.queue.enqueue(&event).await.expect("enqueue").expect("row");

        h.worker.run_once().await.expect("tick");

        assert!(h.queue.get(id).await.expect("get").is_none());
        let log = crate::repository::SyncLogRepository::new(h.pool.clone());
        let entries = log.recent(10, None).await.expect("log");
        assert_eq!(
            entries[0].synced_value.as_deref(),
            Some("play_count=7 (target >= source)")
        );
    }

    #[tokio::test]
    async fn worker_start_is_idempotent_and_stop_is_cooperative() {
        let server = MockServer::start().await;
        let h = harness(&server, |_| {}).await;

        h.worker.start();
        assert!(h.worker.is_running());
        h.worker.start();

        h.worker.stop().await;
        assert!(!h.worker.is_running());
        // Stopping twice is safe.
        h.worker.stop().await;
    }

    #[test]
    fn smart_sync_table() {
        let target = UserDataDto {
            played: Some(true),
            is_favorite: Some(false),
            likes: Some(true),
            play_count: Some(5),
            last_played_date: Some(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).single().expect("ts")),
            audio_stream_index: Some(2),
            subtitle_stream_index: Some(-1),
            ..UserDataDto::default()
        };

        // Matching state skips.
        let data = EventData { is_played: Some(true), ..EventData::default() };
        assert_eq!(
            smart_sync_skip(SyncEventType::Watched, &data, &target).as_deref(),
            Some("played=true (already set)")
        );
        // Differing state writes.
        let data = EventData { is_played: Some(false), ..EventData::default() };
        assert_eq!(smart_sync_skip(SyncEventType::Watched, &data, &target), None);

        let data = EventData { is_favorite: Some(false), ..EventData::default() };
        assert!(smart_sync_skip(SyncEventType::Favorite, &data, &target).is_some());

        let data = EventData { likes: Some(false), ..EventData::default() };
        assert_eq!(smart_sync_skip(SyncEventType::Likes, &data, &target), None);

        // Rating compares on the thumb it maps to.
        let data = EventData { rating: Some(8.0), ..EventData::default() };
        assert!(smart_sync_skip(SyncEventType::Rating, &data, &target).is_some());
        let data = EventData { rating: Some(2.0), ..EventData::default() };
        assert_eq!(smart_sync_skip(SyncEventType::Rating, &data, &target), None);

        // Monotonic fields skip when the target is ahead.
        let data = EventData { play_count: Some(5), ..EventData::default() };
        assert!(smart_sync_skip(SyncEventType::PlayCount, &data, &target).is_some());
        let data = EventData { play_count: Some(6), ..EventData::default() };
        assert_eq!(smart_sync_skip(SyncEventType::PlayCount, &data, &target), None);

        let earlier = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).single().expect("ts");
        let data = EventData { last_played: Some(earlier), ..EventData::default() };
        assert!(smart_sync_skip(SyncEventType::LastPlayed, &data, &target).is_some());

        // Progress never skips, even on equal position.
        let data = EventData { position_ticks: Some(100), ..EventData::default() };
        assert_eq!(smart_sync_skip(SyncEventType::Progress, &data, &target), None);

        let data = EventData { subtitle_stream_index: Some(-1), ..EventData::default() };
        assert!(smart_sync_skip(SyncEventType::SubtitleStream, &data, &target).is_some());
    }
}
