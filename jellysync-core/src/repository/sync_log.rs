use chrono::{Duration, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

use crate::{
    models::{NewSyncLogEntry, SyncLogEntry, SyncStats},
    Result,
};

/// Append-only audit trail of completed and permanently failed mirror
/// writes. The pipeline never reads it; the status API does.
#[derive(Clone)]
pub struct SyncLogRepository {
    pool: SqlitePool,
}

impl SyncLogRepository {
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, entry: &NewSyncLogEntry<'_>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_log
            (event_type, source_peer, target_peer, username, source_item_id,
             item_name, synced_value, success, message, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.event_type)
        .bind(entry.source_peer)
        .bind(entry.target_peer)
        .bind(entry.username)
        .bind(entry.source_item_id)
        .bind(entry.item_name)
        .bind(entry.synced_value)
        .bind(entry.success)
        .bind(entry.message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent entries, optionally limited to the last N minutes.
    pub async fn recent(
        &self,
        limit: i64,
        since_minutes: Option<i64>,
    ) -> Result<Vec<SyncLogEntry>> {
        let rows = if let Some(minutes) = since_minutes {
            let since = Utc::now() - Duration::minutes(minutes);
            sqlx::query(
                r#"
                SELECT id, event_type, source_peer, target_peer, username,
                       source_item_id, item_name, synced_value, success, message, created_at
                FROM sync_log
                WHERE created_at >= ?
                ORDER BY created_at DESC, id DESC
                LIMIT ?
                "#,
            )
            .bind(since)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                SELECT id, event_type, source_peer, target_peer, username,
                       source_item_id, item_name, synced_value, success, message, created_at
                FROM sync_log
                ORDER BY created_at DESC, id DESC
                LIMIT ?
                "#,
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        rows.iter().map(row_to_entry).collect()
    }

    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM sync_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("count")?)
    }

    pub async fn stats(&self) -> Result<SyncStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END), 0) AS successful,
                COALESCE(SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END), 0) AS failed,
                MAX(created_at) AS last_sync_at
            FROM sync_log
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(SyncStats {
            total: row.try_get("total")?,
            successful: row.try_get("successful")?,
            failed: row.try_get("failed")?,
            last_sync_at: row.try_get("last_sync_at")?,
        })
    }
}

fn row_to_entry(row: &SqliteRow) -> Result<SyncLogEntry> {
    Ok(SyncLogEntry {
        id: row.try_get("id")?,
        event_type: row.try_get("event_type")?,
        source_peer: row.try_get("source_peer")?,
        target_peer: row.try_get("target_peer")?,
        username: row.try_get("username")?,
        source_item_id: row.try_get("source_item_id")?,
        item_name: row.try_get("item_name")?,
        synced_value: row.try_get("synced_value")?,
        success: row.try_get("success")?,
        message: row.try_get("message")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::memory_pool;

    fn entry<'a>(success: bool, message: &'a str) -> NewSyncLogEntry<'a> {
        NewSyncLogEntry {
            event_type: "watched",
            source_peer: "wan",
            target_peer: "lan",
            username: "alice",
            source_item_id: Some("item-1"),
            item_name: Some("Test Movie"),
            synced_value: None,
            success,
            message,
        }
    }

    #[tokio::test]
    async fn stats_roll_up_successes_and_failures() {
        let log = SyncLogRepository::new(memory_pool().await);
        log.append(&entry(true, "Synced successfully")).await.expect("append");
        log.append(&entry(true, "Synced successfully")).await.expect("append");
        log.append(&entry(false, "Failed after 5 attempts: timeout"))
            .await
            .expect("append");

        let stats = log.stats().await.expect("stats");
        assert_eq!(stats.total, 3);
        assert_eq!(stats.successful, 2);
        assert_eq!(stats.failed, 1);
        assert!(stats.last_sync_at.is_some());
        assert_eq!(log.count().await.expect("count"), 3);
    }

    #[tokio::test]
    async fn stats_on_empty_log() {
        let log = SyncLogRepository::new(memory_pool().await);
        let stats = log.stats().await.expect("stats");
        assert_eq!(stats.total, 0);
        assert_eq!(stats.last_sync_at, None);
    }

    #[tokio::test]
    async fn recent_honors_since_minutes() {
        let log = SyncLogRepository::new(memory_pool().await);
        log.append(&entry(true, "old")).await.expect("append");
        sqlx::query("UPDATE sync_log SET created_at = ?")
            .bind(Utc::now() - Duration::minutes(120))
            .execute(&log.pool)
            .await
            .expect("age entry");
        log.append(&entry(true, "new")).await.expect("append");

        let all = log.recent(10, None).await.expect("recent");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].message, "new");

        let windowed = log.recent(10, Some(60)).await.expect("recent");
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].message, "new");
    }
}
