use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

use crate::{models::ItemPathCacheEntry, Result};

/// Per-peer map from storage path to peer-local item id.
///
/// Purely a performance layer: entries may be stale, and a 404 from a
/// mutation that used a cached id must invalidate the entry.
#[derive(Clone)]
pub struct ItemPathCacheRepository {
    pool: SqlitePool,
}

impl ItemPathCacheRepository {
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, peer_name: &str, item_path: &str) -> Result<Option<ItemPathCacheEntry>> {
        let row = sqlx::query(
            r#"
            SELECT id, peer_name, item_path, peer_item_id, item_name, updated_at
            FROM item_path_cache
            WHERE peer_name = ? AND item_path = ?
            "#,
        )
        .bind(peer_name)
        .bind(item_path)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| row_to_entry(&row)).transpose()
    }

    pub async fn put(
        &self,
        peer_name: &str,
        item_path: &str,
        peer_item_id: &str,
        item_name: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO item_path_cache (peer_name, item_path, peer_item_id, item_name, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (peer_name, item_path)
            DO UPDATE SET peer_item_id = excluded.peer_item_id,
                          item_name = excluded.item_name,
                          updated_at = excluded.updated_at
            "#,
        )
        .bind(peer_name)
        .bind(item_path)
        .bind(peer_item_id)
        .bind(item_name)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Bulk upsert from a library refresh, all rows in one transaction so a
    /// crash mid-refresh never leaves a half-written snapshot.
    pub async fn put_batch(
        &self,
        peer_name: &str,
        entries: &[(String, String, Option<String>)],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        for (item_path, peer_item_id, item_name) in entries {
            sqlx::query(
                r#"
                INSERT INTO item_path_cache (peer_name, item_path, peer_item_id, item_name, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (peer_name, item_path)
                DO UPDATE SET peer_item_id = excluded.peer_item_id,
                              item_name = excluded.item_name,
                              updated_at = excluded.updated_at
                "#,
            )
            .bind(peer_name)
            .bind(item_path)
            .bind(peer_item_id)
            .bind(item_name.as_deref())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Drop one entry, or every entry for the peer when `item_path` is None.
    pub async fn invalidate(&self, peer_name: &str, item_path: Option<&str>) -> Result<u64> {
        let result = if let Some(path) = item_path {
            sqlx::query("DELETE FROM item_path_cache WHERE peer_name = ? AND item_path = ?")
                .bind(peer_name)
                .bind(path)
                .execute(&self.pool)
                .await?
        } else {
            sqlx::query("DELETE FROM item_path_cache WHERE peer_name = ?")
                .bind(peer_name)
                .execute(&self.pool)
                .await?
        };

        Ok(result.rows_affected())
    }

    pub async fn count_for_peer(&self, peer_name: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM item_path_cache WHERE peer_name = ?")
            .bind(peer_name)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("count")?)
    }
}

fn row_to_entry(row: &SqliteRow) -> Result<ItemPathCacheEntry> {
    Ok(ItemPathCacheEntry {
        id: row.try_get("id")?,
        peer_name: row.try_get("peer_name")?,
        item_path: row.try_get("item_path")?,
        peer_item_id: row.try_get("peer_item_id")?,
        item_name: row.try_get("item_name")?,
        updated_at: row.try_get("updated_at")?,
    })
}
