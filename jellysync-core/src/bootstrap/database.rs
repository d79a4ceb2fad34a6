//! Database initialization

use std::str::FromStr;

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::Config;

/// Open (and create if needed) the SQLite store and apply migrations.
///
/// A single connection is enough: SQLite serializes writes anyway, and the
/// queue's claim/update pattern relies on that serialization.
pub async fn init_database(config: &Config) -> Result<SqlitePool> {
    let journal_mode = SqliteJournalMode::from_str(&config.database.journal_mode)
        .map_err(|e| anyhow::anyhow!("invalid journal_mode '{}': {e}", config.database.journal_mode))?;

    info!(
        path = %config.database.path,
        journal_mode = %config.database.journal_mode,
        "opening database"
    );

    let options = SqliteConnectOptions::new()
        .filename(&config.database.path)
        .create_if_missing(true)
        .journal_mode(journal_mode)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

/// Apply embedded migrations. The single place that invokes the macro.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    info!("running database migrations");
    sqlx::migrate!("../migrations").run(pool).await?;
    Ok(())
}
