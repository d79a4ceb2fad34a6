use chrono::{Duration, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

use crate::{
    models::{
        NewPendingEvent, NewSyncLogEntry, PendingEvent, PendingEventStatus, QueueCounts,
        SyncEventType,
    },
    repository::SyncLogRepository,
    Error, Result,
};

/// Backoff for transient failures: 20s, 40s, 80s, ... capped at 5 minutes.
fn retry_backoff_seconds(retry_count: i64) -> i64 {
    let exponent = u32::try_from(retry_count.max(0)).unwrap_or(u32::MAX);
    10i64.saturating_mul(2i64.saturating_pow(exponent)).min(300)
}

const PENDING_EVENT_COLUMNS: &str = "id, event_type, source_peer, target_peer, username, \
     source_user_id, source_item_id, item_name, item_path, \
     provider_imdb, provider_tmdb, provider_tvdb, event_data, status, \
     retry_count, max_retries, last_error, item_not_found_count, \
     item_not_found_max, created_at, updated_at, next_retry_at";

/// Durable fan-out queue backed by the `pending_events` table.
///
/// The table is the write-ahead log of the pipeline: a row is created per
/// (intent, target peer) before any peer call happens, and only deleted
/// once the mirror write succeeded or permanently failed.
#[derive(Clone)]
pub struct PendingEventRepository {
    pool: SqlitePool,
    log: SyncLogRepository,
}

impl PendingEventRepository {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        let log = SyncLogRepository::new(pool.clone());
        Self { pool, log }
    }

    /// Insert a new row unless a row with the same dedup key
    /// (event_type, target_peer, username, source_item_id) is already in a
    /// non-terminal state. Returns the new row id, or `None` when deduped.
    pub async fn enqueue(&self, event: &NewPendingEvent) -> Result<Option<i64>> {
        if self
            .has_active(
                event.event_type,
                &event.target_peer,
                &event.username,
                &event.source_item_id,
            )
            .await?
        {
            return Ok(None);
        }

        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO pending_events
            (event_type, source_peer, target_peer, username, source_user_id,
             source_item_id, item_name, item_path, provider_imdb, provider_tmdb,
             provider_tvdb, event_data, status, max_retries, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?)
            "#,
        )
        .bind(event.event_type.as_str())
        .bind(&event.source_peer)
        .bind(&event.target_peer)
        .bind(&event.username)
        .bind(&event.source_user_id)
        .bind(&event.source_item_id)
        .bind(&event.item_name)
        .bind(event.item_path.as_deref())
        .bind(event.provider_imdb.as_deref())
        .bind(event.provider_tmdb.as_deref())
        .bind(event.provider_tvdb.as_deref())
        .bind(&event.event_data)
        .bind(event.max_retries)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Some(result.last_insert_rowid()))
    }

    /// Dedup check: is a row with this key in a non-terminal state?
    pub async fn has_active(
        &self,
        event_type: SyncEventType,
        target_peer: &str,
        username: &str,
        source_item_id: &str,
    ) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT 1 FROM pending_events
            WHERE event_type = ?
              AND target_peer = ?
              AND username = ?
              AND source_item_id = ?
              AND status IN ('pending', 'processing', 'waiting_for_item')
            LIMIT 1
            "#,
        )
        .bind(event_type.as_str())
        .bind(target_peer)
        .bind(username)
        .bind(source_item_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    /// Claim due `pending` rows, FIFO on `created_at`. Each returned row has
    /// been transitioned to `processing`.
    pub async fn claim_pending(&self, limit: i64) -> Result<Vec<PendingEvent>> {
        self.claim_due(PendingEventStatus::Pending, limit).await
    }

    /// Claim due `waiting_for_item` rows, same contract as `claim_pending`.
    pub async fn claim_waiting(&self, limit: i64) -> Result<Vec<PendingEvent>> {
        self.claim_due(PendingEventStatus::WaitingForItem, limit).await
    }

    async fn claim_due(
        &self,
        status: PendingEventStatus,
        limit: i64,
    ) -> Result<Vec<PendingEvent>> {
        let now = Utc::now();
        let rows = sqlx::query(&format!(
            r#"
            SELECT {PENDING_EVENT_COLUMNS} FROM pending_events
            WHERE status = ?
              AND (next_retry_at IS NULL OR next_retry_at <= ?)
            ORDER BY created_at ASC, id ASC
            LIMIT ?
            "#
        ))
        .bind(status.as_str())
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let mut event = row_to_event(&row)?;
            // The guarded update makes claim → processing atomic per row.
            let result = sqlx::query(
                "UPDATE pending_events SET status = 'processing', updated_at = ? \
                 WHERE id = ? AND status = ?",
            )
            .bind(Utc::now())
            .bind(event.id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                event.status = PendingEventStatus::Processing;
                claimed.push(event);
            }
        }

        Ok(claimed)
    }

    /// Success: delete the row and append a success entry to the sync log.
    pub async fn complete(&self, id: i64, synced_value: Option<&str>) -> Result<()> {
        let Some(event) = self.get(id).await? else {
            return Ok(());
        };

        self.log
            .append(&NewSyncLogEntry {
                event_type: event.event_type.as_str(),
                source_peer: &event.source_peer,
                target_peer: &event.target_peer,
                username: &event.username,
                source_item_id: Some(&event.source_item_id),
                item_name: Some(&event.item_name),
                synced_value,
                success: true,
                message: "Synced successfully",
            })
            .await?;

        sqlx::query("DELETE FROM pending_events WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Transient failure: schedule a retry with exponential backoff, or
    /// delete the row with a failure log entry once retries are exhausted.
    pub async fn fail(&self, id: i64, error: &str) -> Result<()> {
        let Some(event) = self.get(id).await? else {
            return Ok(());
        };

        let retry_count = event.retry_count + 1;
        if retry_count >= event.max_retries {
            self.log
                .append(&NewSyncLogEntry {
                    event_type: event.event_type.as_str(),
                    source_peer: &event.source_peer,
                    target_peer: &event.target_peer,
                    username: &event.username,
                    source_item_id: Some(&event.source_item_id),
                    item_name: Some(&event.item_name),
                    synced_value: None,
                    success: false,
                    message: &format!("Failed after {retry_count} attempts: {error}"),
                })
                .await?;

            sqlx::query("DELETE FROM pending_events WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            return Ok(());
        }

        let next_retry = Utc::now() + Duration::seconds(retry_backoff_seconds(retry_count));
        sqlx::query(
            r#"
            UPDATE pending_events
            SET status = 'pending',
                retry_count = ?,
                last_error = ?,
                next_retry_at = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(retry_count)
        .bind(error)
        .bind(next_retry)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Target peer has not imported the item yet; park the row until the
    /// policy delay elapses. Tracked separately from transient retries.
    pub async fn mark_waiting_for_item(
        &self,
        id: i64,
        item_not_found_max: i64,
        retry_delay_seconds: u64,
        error: &str,
    ) -> Result<()> {
        let next_retry = Utc::now() + Duration::seconds(retry_delay_seconds as i64);
        sqlx::query(
            r#"
            UPDATE pending_events
            SET status = 'waiting_for_item',
                item_not_found_count = item_not_found_count + 1,
                item_not_found_max = ?,
                last_error = ?,
                next_retry_at = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(item_not_found_max)
        .bind(error)
        .bind(next_retry)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Permanent failure that remains visible: park the row in `failed` and
    /// append a failure entry to the sync log. The status API can re-queue
    /// such rows.
    pub async fn mark_failed(&self, id: i64, message: &str) -> Result<()> {
        let Some(event) = self.get(id).await? else {
            return Ok(());
        };

        self.log
            .append(&NewSyncLogEntry {
                event_type: event.event_type.as_str(),
                source_peer: &event.source_peer,
                target_peer: &event.target_peer,
                username: &event.username,
                source_item_id: Some(&event.source_item_id),
                item_name: Some(&event.item_name),
                synced_value: None,
                success: false,
                message,
            })
            .await?;

        sqlx::query(
            "UPDATE pending_events SET status = 'failed', last_error = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(message)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Demote `processing` rows whose worker evidently died.
    pub async fn reset_stale_processing(&self, stale_minutes: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::minutes(stale_minutes);
        let result = sqlx::query(
            "UPDATE pending_events SET status = 'pending', updated_at = ? \
             WHERE status = 'processing' AND updated_at < ?",
        )
        .bind(Utc::now())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Startup crash recovery: anything left in `processing` goes back to
    /// `pending`.
    pub async fn reset_all_processing(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE pending_events SET status = 'pending', updated_at = ? \
             WHERE status = 'processing'",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Manual re-queue of a failed row; retry counters start over.
    pub async fn reset_for_retry(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pending_events
            SET status = 'pending',
                retry_count = 0,
                item_not_found_count = 0,
                next_retry_at = NULL,
                updated_at = ?
            WHERE id = ? AND status = 'failed'
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, id: i64) -> Result<Option<PendingEvent>> {
        let row = sqlx::query(&format!(
            "SELECT {PENDING_EVENT_COLUMNS} FROM pending_events WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| row_to_event(&row)).transpose()
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM pending_events GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            match PendingEventStatus::parse(&status) {
                Some(PendingEventStatus::Pending) => counts.pending = count,
                Some(PendingEventStatus::Processing) => counts.processing = count,
                Some(PendingEventStatus::WaitingForItem) => counts.waiting_for_item = count,
                Some(PendingEventStatus::Failed) => counts.failed = count,
                None => {}
            }
        }

        Ok(counts)
    }

    /// Read-only view for the status API; pending and waiting rows in FIFO
    /// order, failed rows most recent first.
    pub async fn list_by_status(
        &self,
        status: PendingEventStatus,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<PendingEvent>> {
        let order = match status {
            PendingEventStatus::Failed => "updated_at DESC, id DESC",
            _ => "created_at ASC, id ASC",
        };
        let rows = sqlx::query(&format!(
            "SELECT {PENDING_EVENT_COLUMNS} FROM pending_events \
             WHERE status = ? ORDER BY {order} LIMIT ? OFFSET ?"
        ))
        .bind(status.as_str())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }
}

fn row_to_event(row: &SqliteRow) -> Result<PendingEvent> {
    let event_type: String = row.try_get("event_type")?;
    let status: String = row.try_get("status")?;

    Ok(PendingEvent {
        id: row.try_get("id")?,
        event_type: SyncEventType::parse(&event_type)
            .ok_or_else(|| Error::Internal(format!("unknown event type in queue: {event_type}")))?,
        source_peer: row.try_get("source_peer")?,
        target_peer: row.try_get("target_peer")?,
        username: row.try_get("username")?,
        source_user_id: row.try_get("source_user_id")?,
        source_item_id: row.try_get("source_item_id")?,
        item_name: row.try_get("item_name")?,
        item_path: row.try_get("item_path")?,
        provider_imdb: row.try_get("provider_imdb")?,
        provider_tmdb: row.try_get("provider_tmdb")?,
        provider_tvdb: row.try_get("provider_tvdb")?,
        event_data: row.try_get("event_data")?,
        status: PendingEventStatus::parse(&status)
            .ok_or_else(|| Error::Internal(format!("unknown queue status: {status}")))?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        last_error: row.try_get("last_error")?,
        item_not_found_count: row.try_get("item_not_found_count")?,
        item_not_found_max: row.try_get("item_not_found_max")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        next_retry_at: row.try_get("next_retry_at")?,
    })
}
