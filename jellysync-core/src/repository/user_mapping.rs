use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

use crate::{models::UserMapping, Result};

/// (username, peer) → peer-local user id. Usernames are lowercased on
/// write and on lookup so casing differences between peers collapse into
/// one identity.
#[derive(Clone)]
pub struct UserMappingRepository {
    pool: SqlitePool,
}

impl UserMappingRepository {
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, username: &str, peer_name: &str) -> Result<Option<UserMapping>> {
        let row = sqlx::query(
            r#"
            SELECT id, username, peer_name, peer_user_id, created_at, updated_at
            FROM user_mappings
            WHERE username = ? AND peer_name = ?
            "#,
        )
        .bind(username.to_lowercase())
        .bind(peer_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| row_to_mapping(&row)).transpose()
    }

    /// Insert or refresh a mapping. The unique constraint on
    /// (username, peer_name) makes concurrent upserts race-tolerant.
    pub async fn upsert(
        &self,
        username: &str,
        peer_name: &str,
        peer_user_id: &str,
    ) -> Result<UserMapping> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO user_mappings (username, peer_name, peer_user_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (username, peer_name)
            DO UPDATE SET peer_user_id = excluded.peer_user_id,
                          updated_at = excluded.updated_at
            RETURNING id, username, peer_name, peer_user_id, created_at, updated_at
            "#,
        )
        .bind(username.to_lowercase())
        .bind(peer_name)
        .bind(peer_user_id)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        row_to_mapping(&row)
    }

    pub async fn delete(&self, username: &str, peer_name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM user_mappings WHERE username = ? AND peer_name = ?")
            .bind(username.to_lowercase())
            .bind(peer_name)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_for_username(&self, username: &str) -> Result<Vec<UserMapping>> {
        let rows = sqlx::query(
            r#"
            SELECT id, username, peer_name, peer_user_id, created_at, updated_at
            FROM user_mappings
            WHERE username = ?
            ORDER BY peer_name
            "#,
        )
        .bind(username.to_lowercase())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_mapping).collect()
    }

    pub async fn list_all(&self) -> Result<Vec<UserMapping>> {
        let rows = sqlx::query(
            r#"
            SELECT id, username, peer_name, peer_user_id, created_at, updated_at
            FROM user_mappings
            ORDER BY username, peer_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_mapping).collect()
    }

    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM user_mappings")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("count")?)
    }
}

fn row_to_mapping(row: &SqliteRow) -> Result<UserMapping> {
    Ok(UserMapping {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        peer_name: row.try_get("peer_name")?,
        peer_user_id: row.try_get("peer_user_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
