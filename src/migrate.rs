//! Idempotent catalog schema creation.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS servers (
        server_name TEXT PRIMARY KEY,
        host TEXT NOT NULL,
        port INTEGER NOT NULL,
        user TEXT NOT NULL,
        password TEXT NOT NULL,
        driver TEXT NOT NULL DEFAULT 'mysql',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS buckets (
        bucket_name TEXT PRIMARY KEY,
        region TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS folders (
        bucket_name TEXT NOT NULL,
        folder_name TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (bucket_name, folder_name),
        FOREIGN KEY (bucket_name) REFERENCES buckets(bucket_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS objects (
        bucket_name TEXT NOT NULL,
        folder_name TEXT NOT NULL,
        object_name TEXT NOT NULL,
        version INTEGER NOT NULL,
        size INTEGER NOT NULL,
        content_type TEXT NOT NULL,
        sha256 TEXT NOT NULL,
        blob_key TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (bucket_name, folder_name, object_name, version),
        FOREIGN KEY (bucket_name, folder_name) REFERENCES folders(bucket_name, folder_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        target TEXT NOT NULL,
        status TEXT NOT NULL,
        detail TEXT,
        started_at TEXT NOT NULL,
        finished_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS warehouse_databases (
        database_name TEXT PRIMARY KEY,
        storage_engine TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS warehouse_tables (
        database_name TEXT NOT NULL,
        table_name TEXT NOT NULL,
        columns_json TEXT,
        last_load_job TEXT,
        last_load_status TEXT,
        created_at TEXT NOT NULL,
        PRIMARY KEY (database_name, table_name),
        FOREIGN KEY (database_name) REFERENCES warehouse_databases(database_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS table_loads (
        job_id TEXT PRIMARY KEY,
        database_name TEXT NOT NULL,
        table_name TEXT NOT NULL,
        load_file TEXT NOT NULL,
        mode TEXT NOT NULL,
        rows_loaded INTEGER NOT NULL,
        rows_total INTEGER NOT NULL,
        first_rowid INTEGER,
        last_rowid INTEGER,
        status TEXT NOT NULL,
        reverted INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_started_at ON jobs(started_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_table_loads_table ON table_loads(database_name, table_name)",
];

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every catalog table on an open pool.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
