//! Catalog database connection and sqlx error mapping.

use anyhow::Result;
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Transaction;
use std::str::FromStr;

use etl_harness_core::error::EtlError;

use crate::config::Config;

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Map a catalog failure into the taxonomy.
pub fn db_err(err: sqlx::Error) -> EtlError {
    EtlError::internal(format!("catalog: {}", err))
}

/// Catalog write transaction (`BEGIN IMMEDIATE`): reads inside it never
/// race another writer's commit.
pub async fn begin_write(pool: &SqlitePool) -> std::result::Result<Transaction<'static, Sqlite>, EtlError> {
    pool.begin_with("BEGIN IMMEDIATE").await.map_err(db_err)
}

pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Current UTC time as RFC 3339 with second precision.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();
    crate::migrate::migrate_pool(&pool).await.unwrap();
    pool
}
