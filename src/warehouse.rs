//! Warehouse: databases, tables and loads.
//!
//! Each warehouse database is one SQLite file `<warehouse.root>/<db>.sqlite`;
//! its `storage_engine` is recorded in the catalog as metadata. Catalog rows
//! (`warehouse_databases`, `warehouse_tables`, `table_loads`) describe what
//! exists; the files hold the rows.
//!
//! # Loads
//!
//! A load appends the rows of one staged CSV to a table. Writers to one
//! table serialize on the `dw:<db>/<table>` key.
//!
//! - `atomic` (default): one transaction; a failure keeps nothing.
//! - `bulk`: a transaction per `batch_size` rows. A failure keeps the
//!   batches already committed and reports how many rows they hold; the
//!   load can be undone later with [`Warehouse::revert_load`], which deletes
//!   the load's rowid range.
//!
//! A table created without columns adopts the inferred schema of its first
//! load.

use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode};
use sqlx::{Connection, Row, SqlitePool};
use tracing::{info, warn};

use etl_harness_core::error::{EtlError, LoadFailure, Result};
use etl_harness_core::frame::Frame;
use etl_harness_core::models::{
    validate_column_name, validate_identifier, ColumnDef, ObjectKey, WarehouseDatabase, WarehouseTable,
    STORAGE_ENGINES,
};
use etl_harness_core::options::{LoadFlags, LoadMode};

use crate::config::{LoadConfig, WarehouseConfig};
use crate::db::{begin_write, db_err, is_unique_violation, now_iso};
use crate::jobs::{JobHandle, JobTracker};
use crate::locks::{table_key, KeyedLocks};
use crate::sqlite_frame::{self, quote_ident, user_sql_err};
use crate::staging::StagingStore;

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseDetails {
    #[serde(flatten)]
    pub database: WarehouseDatabase,
    pub tables: Vec<WarehouseTable>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableLoad {
    pub job_id: String,
    pub database_name: String,
    pub table_name: String,
    pub load_file: String,
    pub mode: String,
    pub rows_loaded: i64,
    pub rows_total: i64,
    pub first_rowid: Option<i64>,
    pub last_rowid: Option<i64>,
    pub status: String,
    pub reverted: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableDetails {
    #[serde(flatten)]
    pub table: WarehouseTable,
    pub row_count: i64,
    pub loads: Vec<TableLoad>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub job_id: String,
    pub database: String,
    pub table: String,
    pub load_file: String,
    pub version: i64,
    pub mode: LoadMode,
    pub rows_loaded: u64,
    pub rows_total: u64,
    pub schema_adopted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RevertReport {
    pub job_id: String,
    pub database: String,
    pub table: String,
    pub rows_deleted: u64,
}

/// Rows committed by a load so far.
#[derive(Debug, Default)]
struct Progress {
    rows: u64,
    first_rowid: Option<i64>,
    last_rowid: Option<i64>,
}

impl Progress {
    fn extend(&mut self, rowids: &[i64]) {
        self.rows += rowids.len() as u64;
        for &id in rowids {
            self.first_rowid = Some(self.first_rowid.map_or(id, |f| f.min(id)));
            self.last_rowid = Some(self.last_rowid.map_or(id, |l| l.max(id)));
        }
    }
}

#[derive(Clone)]
pub struct Warehouse {
    pool: SqlitePool,
    staging: StagingStore,
    locks: KeyedLocks,
    jobs: JobTracker,
    config: WarehouseConfig,
    load: LoadConfig,
}

fn row_to_table(row: &sqlx::sqlite::SqliteRow) -> Result<WarehouseTable> {
    let columns_json: Option<String> = row.get("columns_json");
    let columns = columns_json
        .map(|j| serde_json::from_str::<Vec<ColumnDef>>(&j))
        .transpose()
        .map_err(|e| EtlError::internal(format!("corrupt column catalog: {}", e)))?;
    Ok(WarehouseTable {
        database_name: row.get("database_name"),
        table_name: row.get("table_name"),
        columns,
        last_load_job: row.get("last_load_job"),
        last_load_status: row.get("last_load_status"),
        created_at: row.get("created_at"),
    })
}

fn row_to_load(row: &sqlx::sqlite::SqliteRow) -> TableLoad {
    TableLoad {
        job_id: row.get("job_id"),
        database_name: row.get("database_name"),
        table_name: row.get("table_name"),
        load_file: row.get("load_file"),
        mode: row.get("mode"),
        rows_loaded: row.get("rows_loaded"),
        rows_total: row.get("rows_total"),
        first_rowid: row.get("first_rowid"),
        last_rowid: row.get("last_rowid"),
        status: row.get("status"),
        reverted: row.get::<i64, _>("reverted") != 0,
        created_at: row.get("created_at"),
    }
}

const TABLE_COLUMNS: &str =
    "database_name, table_name, columns_json, last_load_job, last_load_status, created_at";
const LOAD_COLUMNS: &str = "job_id, database_name, table_name, load_file, mode, rows_loaded, rows_total, \
     first_rowid, last_rowid, status, reverted, created_at";

fn check_columns(columns: &[ColumnDef]) -> Result<()> {
    if columns.is_empty() {
        return Err(EtlError::invalid("a table needs at least one column"));
    }
    let mut seen = std::collections::HashSet::new();
    for c in columns {
        validate_column_name(&c.name)?;
        if !seen.insert(c.name.to_ascii_lowercase()) {
            return Err(EtlError::invalid(format!("duplicate column '{}'", c.name)));
        }
    }
    Ok(())
}

impl Warehouse {
    pub fn new(
        pool: SqlitePool,
        staging: StagingStore,
        locks: KeyedLocks,
        jobs: JobTracker,
        config: WarehouseConfig,
        load: LoadConfig,
    ) -> Self {
        Self {
            pool,
            staging,
            locks,
            jobs,
            config,
            load,
        }
    }

    /// Path of a database's SQLite file.
    pub fn database_path(&self, name: &str) -> PathBuf {
        self.config.root.join(format!("{}.sqlite", name))
    }

    /// Open a database file for writing.
    async fn open(&self, name: &str, create: bool) -> Result<SqliteConnection> {
        if create {
            std::fs::create_dir_all(&self.config.root)
                .map_err(|e| EtlError::internal(format!("warehouse root: {}", e)))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(self.database_path(name))
            .create_if_missing(create)
            .journal_mode(SqliteJournalMode::Wal);
        SqliteConnection::connect_with(&options)
            .await
            .map_err(|e| EtlError::internal(format!("warehouse database '{}': {}", name, e)))
    }

    // ============ Databases ============

    pub async fn list_databases(&self) -> Result<Vec<WarehouseDatabase>> {
        let rows = sqlx::query(
            "SELECT database_name, storage_engine, created_at FROM warehouse_databases ORDER BY database_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows
            .iter()
            .map(|r| WarehouseDatabase {
                database_name: r.get("database_name"),
                storage_engine: r.get("storage_engine"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    pub async fn create_database(&self, name: &str, storage_engine: Option<&str>) -> Result<WarehouseDatabase> {
        validate_identifier("database", name)?;
        let engine = storage_engine
            .unwrap_or(&self.config.default_storage_engine)
            .to_ascii_lowercase();
        if !STORAGE_ENGINES.contains(&engine.as_str()) {
            return Err(EtlError::invalid(format!(
                "unknown storage engine '{}' (expected one of: {})",
                engine,
                STORAGE_ENGINES.join(", ")
            )));
        }
        if self.find_database(name).await?.is_some() {
            return Err(EtlError::DuplicateKey(format!("database '{}'", name)));
        }

        self.open(name, true).await?.close().await.map_err(EtlError::internal)?;
        let now = now_iso();
        sqlx::query("INSERT INTO warehouse_databases (database_name, storage_engine, created_at) VALUES (?, ?, ?)")
            .bind(name)
            .bind(&engine)
            .bind(&now)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    EtlError::DuplicateKey(format!("database '{}'", name))
                } else {
                    db_err(e)
                }
            })?;
        info!(database = %name, engine = %engine, "warehouse database created");
        Ok(WarehouseDatabase {
            database_name: name.to_string(),
            storage_engine: engine,
            created_at: now,
        })
    }

    async fn find_database(&self, name: &str) -> Result<Option<WarehouseDatabase>> {
        let row = sqlx::query(
            "SELECT database_name, storage_engine, created_at FROM warehouse_databases WHERE database_name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(|r| WarehouseDatabase {
            database_name: r.get("database_name"),
            storage_engine: r.get("storage_engine"),
            created_at: r.get("created_at"),
        }))
    }

    /// The catalog entry of a database, or `NotFound`.
    pub async fn require_database(&self, name: &str) -> Result<WarehouseDatabase> {
        self.find_database(name)
            .await?
            .ok_or_else(|| EtlError::not_found(format!("database '{}'", name)))
    }

    pub async fn get_database(&self, name: &str) -> Result<DatabaseDetails> {
        let database = self.require_database(name).await?;
        let tables = self.list_tables(name).await?;
        Ok(DatabaseDetails { database, tables })
    }

    /// Delete a database. One with tables needs `cascade`.
    pub async fn delete_database(&self, name: &str, cascade: bool) -> Result<()> {
        self.require_database(name).await?;
        let tables = self.list_tables(name).await?;
        if !tables.is_empty() && !cascade {
            return Err(EtlError::Conflict(format!(
                "database '{}' still has {} table(s); pass cascade=true to drop them",
                name,
                tables.len()
            )));
        }
        let _locks = self
            .locks
            .acquire_many(tables.iter().map(|t| table_key(name, &t.table_name)))
            .await;

        let mut tx = begin_write(&self.pool).await?;
        for sql in [
            "DELETE FROM table_loads WHERE database_name = ?",
            "DELETE FROM warehouse_tables WHERE database_name = ?",
            "DELETE FROM warehouse_databases WHERE database_name = ?",
        ] {
            sqlx::query(sql).bind(name).execute(&mut *tx).await.map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;

        let path = self.database_path(name);
        for suffix in ["", "-wal", "-shm"] {
            let file = PathBuf::from(format!("{}{}", path.display(), suffix));
            if let Err(e) = std::fs::remove_file(&file) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(file = %file.display(), error = %e, "failed to remove warehouse file");
                }
            }
        }
        info!(database = %name, tables = tables.len(), "warehouse database deleted");
        Ok(())
    }

    // ============ Tables ============

    pub async fn list_tables(&self, database: &str) -> Result<Vec<WarehouseTable>> {
        self.require_database(database).await?;
        let rows = sqlx::query(&format!(
            "SELECT {} FROM warehouse_tables WHERE database_name = ? ORDER BY table_name",
            TABLE_COLUMNS
        ))
        .bind(database)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_table).collect()
    }

    async fn find_table(&self, database: &str, table: &str) -> Result<Option<WarehouseTable>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM warehouse_tables WHERE database_name = ? AND table_name = ?",
            TABLE_COLUMNS
        ))
        .bind(database)
        .bind(table)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_table).transpose()
    }

    async fn require_table(&self, database: &str, table: &str) -> Result<WarehouseTable> {
        self.require_database(database).await?;
        self.find_table(database, table)
            .await?
            .ok_or_else(|| EtlError::not_found(format!("table '{}.{}'", database, table)))
    }

    /// Register a table. With `columns` the physical table is created now;
    /// without, on the first load.
    pub async fn create_table(
        &self,
        database: &str,
        table: &str,
        columns: Option<Vec<ColumnDef>>,
    ) -> Result<WarehouseTable> {
        validate_identifier("table", table)?;
        if let Some(cols) = &columns {
            check_columns(cols)?;
        }
        self.require_database(database).await?;
        let _guard = self.locks.acquire(&table_key(database, table)).await;
        if self.find_table(database, table).await?.is_some() {
            return Err(EtlError::DuplicateKey(format!("table '{}.{}'", database, table)));
        }

        let mut conn = self.open(database, false).await?;
        if sqlite_frame::table_exists(&mut conn, table).await? {
            let sql = format!("DROP TABLE {}", quote_ident(table));
            sqlx::query(&sql).execute(&mut conn).await.map_err(user_sql_err)?;
        }
        if let Some(cols) = &columns {
            sqlite_frame::create_table(&mut conn, table, cols).await?;
        }
        conn.close().await.map_err(EtlError::internal)?;

        let now = now_iso();
        let columns_json = columns
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(EtlError::internal)?;
        sqlx::query(
            "INSERT INTO warehouse_tables (database_name, table_name, columns_json, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(database)
        .bind(table)
        .bind(columns_json)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        info!(database, table, declared = columns.is_some(), "warehouse table created");
        Ok(WarehouseTable {
            database_name: database.to_string(),
            table_name: table.to_string(),
            columns,
            last_load_job: None,
            last_load_status: None,
            created_at: now,
        })
    }

    pub async fn get_table(&self, database: &str, table: &str) -> Result<TableDetails> {
        let entry = self.require_table(database, table).await?;
        let mut conn = self.open(database, false).await?;
        let row_count = if sqlite_frame::table_exists(&mut conn, table).await? {
            let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
            sqlx::query_scalar::<_, i64>(&sql)
                .fetch_one(&mut conn)
                .await
                .map_err(user_sql_err)?
        } else {
            0
        };
        conn.close().await.map_err(EtlError::internal)?;
        let loads = self.list_loads(database, table).await?;
        Ok(TableDetails {
            table: entry,
            row_count,
            loads,
        })
    }

    pub async fn delete_table(&self, database: &str, table: &str) -> Result<()> {
        self.require_table(database, table).await?;
        let _guard = self.locks.acquire(&table_key(database, table)).await;

        let mut conn = self.open(database, false).await?;
        let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(table));
        sqlx::query(&sql).execute(&mut conn).await.map_err(user_sql_err)?;
        conn.close().await.map_err(EtlError::internal)?;

        let mut tx = begin_write(&self.pool).await?;
        for sql in [
            "DELETE FROM table_loads WHERE database_name = ? AND table_name = ?",
            "DELETE FROM warehouse_tables WHERE database_name = ? AND table_name = ?",
        ] {
            sqlx::query(sql)
                .bind(database)
                .bind(table)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        info!(database, table, "warehouse table deleted");
        Ok(())
    }

    async fn list_loads(&self, database: &str, table: &str) -> Result<Vec<TableLoad>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM table_loads WHERE database_name = ? AND table_name = ? \
             ORDER BY created_at DESC, rowid DESC LIMIT 50",
            LOAD_COLUMNS
        ))
        .bind(database)
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.iter().map(row_to_load).collect())
    }

    // ============ Loads ============

    /// Append the rows of a staged CSV to a table.
    pub async fn load_table(
        &self,
        database: &str,
        table: &str,
        load_file: &str,
        flags: &Value,
    ) -> Result<LoadReport> {
        let flags = LoadFlags::from_value(flags)?;
        let key = ObjectKey::parse(load_file)?;
        let entry = self.require_table(database, table).await?;

        let job = self
            .jobs
            .start("load_table", &format!("{}.{} <- {}", database, table, key))
            .await?;
        let result = self.run_load(&job, entry, &key, &flags).await;
        job.record(&result).await;
        result
    }

    async fn run_load(
        &self,
        job: &JobHandle,
        entry: WarehouseTable,
        key: &ObjectKey,
        flags: &LoadFlags,
    ) -> Result<LoadReport> {
        let database = entry.database_name.as_str();
        let table = entry.table_name.as_str();
        let _guard = self.locks.acquire(&table_key(database, table)).await;

        let (info, bytes) = self.staging.download(key, None).await?;
        let frame = Frame::from_csv(&bytes, &flags.csv_options())?;
        let rows_total = frame.num_rows() as u64;

        // Re-read under the lock: a concurrent first load may have adopted a schema.
        let columns = self
            .find_table(database, table)
            .await?
            .ok_or_else(|| EtlError::not_found(format!("table '{}.{}'", database, table)))?
            .columns;
        let mut conn = self.open(database, false).await?;
        let schema_adopted = match &columns {
            Some(cols) => {
                check_frame_fits(&frame, cols)?;
                false
            }
            None => {
                let adopted: Vec<ColumnDef> = frame
                    .infer_schema()
                    .into_iter()
                    .map(|c| ColumnDef { nullable: true, ..c })
                    .collect();
                check_columns(&adopted)?;
                sqlite_frame::create_table(&mut conn, table, &adopted).await?;
                let json = serde_json::to_string(&adopted).map_err(EtlError::internal)?;
                sqlx::query("UPDATE warehouse_tables SET columns_json = ? WHERE database_name = ? AND table_name = ?")
                    .bind(json)
                    .bind(database)
                    .bind(table)
                    .execute(&self.pool)
                    .await
                    .map_err(db_err)?;
                info!(database, table, columns = adopted.len(), "schema adopted from first load");
                true
            }
        };

        let mut progress = Progress::default();
        let mut outcome = match flags.mode {
            LoadMode::Atomic => self.insert_atomic(&mut conn, table, &frame, &mut progress).await,
            LoadMode::Bulk => {
                let batch = flags.batch_size.unwrap_or(self.load.batch_size).max(1);
                self.insert_bulk(job, &mut conn, table, &frame, batch, &mut progress)
                    .await
            }
        };
        // A cancelled load leaves the table as it was before the load.
        if matches!(outcome, Err(EtlError::Cancelled(_))) && progress.rows > 0 {
            match discard_rows(&mut conn, table, &progress).await {
                Ok(deleted) => {
                    info!(database, table, rows_deleted = deleted, "cancelled load rolled back");
                    progress = Progress::default();
                }
                Err(e) => outcome = Err(e),
            }
        }
        if let Err(e) = conn.close().await {
            warn!(database, table, error = %e, "failed to close warehouse connection");
        }

        let status = match &outcome {
            Ok(()) => "succeeded",
            Err(EtlError::Cancelled(_)) => "cancelled",
            Err(_) => "failed",
        };
        self.record_load(job.id(), database, table, key, flags.mode, &progress, rows_total, status)
            .await?;

        match outcome {
            Ok(()) => {
                info!(database, table, rows = progress.rows, mode = flags.mode.as_str(), "load complete");
                Ok(LoadReport {
                    job_id: job.id().to_string(),
                    database: database.to_string(),
                    table: table.to_string(),
                    load_file: key.to_string(),
                    version: info.version,
                    mode: flags.mode,
                    rows_loaded: progress.rows,
                    rows_total,
                    schema_adopted,
                })
            }
            Err(EtlError::Cancelled(msg)) => {
                warn!(database, table, rows_total, "load cancelled");
                Err(EtlError::Cancelled(msg))
            }
            Err(cause) => {
                warn!(database, table, rows_loaded = progress.rows, error = %cause, "load failed");
                Err(EtlError::LoadFailed(LoadFailure {
                    database: database.to_string(),
                    table: table.to_string(),
                    job_id: job.id().to_string(),
                    rows_loaded: progress.rows,
                    rows_total,
                    retained: progress.rows > 0,
                    cause: cause.to_string(),
                }))
            }
        }
    }

    async fn insert_atomic(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        frame: &Frame,
        progress: &mut Progress,
    ) -> Result<()> {
        let mut tx = conn.begin().await.map_err(EtlError::internal)?;
        let rowids = sqlite_frame::insert_rows(&mut *tx, table, &frame.columns, &frame.rows).await?;
        tx.commit().await.map_err(EtlError::internal)?;
        progress.extend(&rowids);
        Ok(())
    }

    async fn insert_bulk(
        &self,
        job: &JobHandle,
        conn: &mut SqliteConnection,
        table: &str,
        frame: &Frame,
        batch_size: usize,
        progress: &mut Progress,
    ) -> Result<()> {
        for batch in frame.rows.chunks(batch_size) {
            job.check_cancelled()?;
            let mut tx = conn.begin().await.map_err(EtlError::internal)?;
            let rowids = sqlite_frame::insert_rows(&mut *tx, table, &frame.columns, batch).await?;
            tx.commit().await.map_err(EtlError::internal)?;
            progress.extend(&rowids);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_load(
        &self,
        job_id: &str,
        database: &str,
        table: &str,
        key: &ObjectKey,
        mode: LoadMode,
        progress: &Progress,
        rows_total: u64,
        status: &str,
    ) -> Result<()> {
        let mut tx = begin_write(&self.pool).await?;
        sqlx::query(&format!(
            "INSERT INTO table_loads ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)",
            LOAD_COLUMNS
        ))
        .bind(job_id)
        .bind(database)
        .bind(table)
        .bind(key.to_string())
        .bind(mode.as_str())
        .bind(progress.rows as i64)
        .bind(rows_total as i64)
        .bind(progress.first_rowid)
        .bind(progress.last_rowid)
        .bind(status)
        .bind(now_iso())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query(
            "UPDATE warehouse_tables SET last_load_job = ?, last_load_status = ? \
             WHERE database_name = ? AND table_name = ?",
        )
        .bind(job_id)
        .bind(status)
        .bind(database)
        .bind(table)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)
    }

    /// Delete the rows a load committed. `Conflict` if already reverted.
    pub async fn revert_load(&self, database: &str, table: &str, job_id: &str) -> Result<RevertReport> {
        self.require_table(database, table).await?;
        let _guard = self.locks.acquire(&table_key(database, table)).await;
        let load = sqlx::query(&format!(
            "SELECT {} FROM table_loads WHERE job_id = ? AND database_name = ? AND table_name = ?",
            LOAD_COLUMNS
        ))
        .bind(job_id)
        .bind(database)
        .bind(table)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .map(|r| row_to_load(&r))
        .ok_or_else(|| EtlError::not_found(format!("load '{}' of {}.{}", job_id, database, table)))?;
        if load.reverted {
            return Err(EtlError::Conflict(format!("load '{}' was already reverted", job_id)));
        }

        let mut rows_deleted = 0;
        if let (Some(first), Some(last)) = (load.first_rowid, load.last_rowid) {
            let mut conn = self.open(database, false).await?;
            let sql = format!("DELETE FROM {} WHERE rowid BETWEEN ? AND ?", quote_ident(table));
            let done = sqlx::query(&sql)
                .bind(first)
                .bind(last)
                .execute(&mut conn)
                .await
                .map_err(user_sql_err)?;
            rows_deleted = done.rows_affected();
            conn.close().await.map_err(EtlError::internal)?;
        }
        sqlx::query("UPDATE table_loads SET reverted = 1, status = 'reverted' WHERE job_id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        info!(database, table, job = job_id, rows_deleted, "load reverted");
        Ok(RevertReport {
            job_id: job_id.to_string(),
            database: database.to_string(),
            table: table.to_string(),
            rows_deleted,
        })
    }
}

/// Every frame column must exist in the table; omitted table columns must
/// be nullable.
fn check_frame_fits(frame: &Frame, columns: &[ColumnDef]) -> Result<()> {
    for name in &frame.columns {
        if !columns.iter().any(|c| &c.name == name) {
            return Err(EtlError::invalid(format!(
                "file column '{}' does not exist in the table (columns: {})",
                name,
                columns.iter().map(|c| c.name.as_str()).collect::<Vec<_>>().join(", ")
            )));
        }
    }
    if let Some(missing) = columns
        .iter()
        .find(|c| !c.nullable && !frame.columns.contains(&c.name))
    {
        return Err(EtlError::invalid(format!(
            "file has no value for NOT NULL column '{}'",
            missing.name
        )));
    }
    Ok(())
}

/// Delete the rows a load committed so far, in one transaction.
async fn discard_rows(conn: &mut SqliteConnection, table: &str, progress: &Progress) -> Result<u64> {
    let (Some(first), Some(last)) = (progress.first_rowid, progress.last_rowid) else {
        return Ok(0);
    };
    let mut tx = conn.begin().await.map_err(EtlError::internal)?;
    let sql = format!("DELETE FROM {} WHERE rowid BETWEEN ? AND ?", quote_ident(table));
    let done = sqlx::query(&sql)
        .bind(first)
        .bind(last)
        .execute(&mut *tx)
        .await
        .map_err(user_sql_err)?;
    tx.commit().await.map_err(EtlError::internal)?;
    Ok(done.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use crate::jobs::JobStatus;
    use etl_harness_core::error::ErrorKind;
    use etl_harness_core::models::ColumnType;
    use etl_harness_core::store::memory::InMemoryBlobStore;
    use serde_json::json;
    use std::sync::Arc;

    async fn setup(root: &std::path::Path) -> Warehouse {
        let pool = memory_pool().await;
        let locks = KeyedLocks::new();
        let staging = StagingStore::new(pool.clone(), Arc::new(InMemoryBlobStore::new()), locks.clone());
        staging.create_bucket("etl-staging", "us-east-1").await.unwrap();
        staging.create_folder("etl-staging", "files").await.unwrap();
        staging
            .upload(
                &ObjectKey::new("etl-staging", "files", "orders.csv"),
                b"id,item\n1,pen\n2,ink\n3,\n".to_vec(),
                None,
            )
            .await
            .unwrap();
        let config = WarehouseConfig {
            root: root.to_path_buf(),
            ..Default::default()
        };
        Warehouse::new(pool.clone(), staging, locks, JobTracker::new(pool), config, LoadConfig::default())
    }

    #[tokio::test]
    async fn database_crud() {
        let tmp = tempfile::tempdir().unwrap();
        let w = setup(tmp.path()).await;
        let db = w.create_database("sales", None).await.unwrap();
        assert_eq!(db.storage_engine, "columnstore");
        assert!(w.database_path("sales").exists());
        assert_eq!(w.create_database("sales", None).await.unwrap_err().kind(), ErrorKind::DuplicateKey);
        assert_eq!(
            w.create_database("other", Some("rocksdb")).await.unwrap_err().kind(),
            ErrorKind::InvalidParams
        );
        w.create_table("sales", "orders", None).await.unwrap();
        assert_eq!(w.delete_database("sales", false).await.unwrap_err().kind(), ErrorKind::Conflict);
        w.delete_database("sales", true).await.unwrap();
        assert!(!w.database_path("sales").exists());
        assert_eq!(w.get_database("sales").await.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn loads_append_and_adopt_schema() {
        let tmp = tempfile::tempdir().unwrap();
        let w = setup(tmp.path()).await;
        w.create_database("sales", None).await.unwrap();
        w.create_table("sales", "orders", None).await.unwrap();

        let first = w
            .load_table("sales", "orders", "s3://etl-staging/files/orders.csv", &Value::Null)
            .await
            .unwrap();
        assert!(first.schema_adopted);
        assert_eq!(first.rows_loaded, 3);
        let second = w
            .load_table("sales", "orders", "etl-staging/files/orders.csv", &json!("mode=bulk batch_size=1"))
            .await
            .unwrap();
        assert!(!second.schema_adopted);

        let details = w.get_table("sales", "orders").await.unwrap();
        assert_eq!(details.row_count, 6);
        assert_eq!(details.loads.len(), 2);
        let cols = details.table.columns.unwrap();
        assert_eq!(cols[0].column_type, ColumnType::Integer);

        let reverted = w.revert_load("sales", "orders", &second.job_id).await.unwrap();
        assert_eq!(reverted.rows_deleted, 3);
        assert_eq!(w.get_table("sales", "orders").await.unwrap().row_count, 3);
        assert_eq!(
            w.revert_load("sales", "orders", &second.job_id).await.unwrap_err().kind(),
            ErrorKind::Conflict
        );
    }

    #[tokio::test]
    async fn bulk_failure_retains_committed_batches() {
        let tmp = tempfile::tempdir().unwrap();
        let w = setup(tmp.path()).await;
        w.create_database("sales", None).await.unwrap();
        let cols = vec![
            ColumnDef {
                name: "id".into(),
                column_type: ColumnType::Integer,
                nullable: false,
            },
            ColumnDef {
                name: "item".into(),
                column_type: ColumnType::Text,
                nullable: false,
            },
        ];
        w.create_table("sales", "orders", Some(cols)).await.unwrap();

        let err = w
            .load_table("sales", "orders", "etl-staging/files/orders.csv", &json!({"mode": "bulk", "batch_size": 1}))
            .await
            .unwrap_err();
        match &err {
            EtlError::LoadFailed(f) => {
                assert_eq!((f.rows_loaded, f.rows_total), (2, 3));
                assert!(f.retained);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        let details = w.get_table("sales", "orders").await.unwrap();
        assert_eq!(details.row_count, 2);
        assert_eq!(details.table.last_load_status.as_deref(), Some("failed"));

        let err = w
            .load_table("sales", "orders", "etl-staging/files/orders.csv", &Value::Null)
            .await
            .unwrap_err();
        match err {
            EtlError::LoadFailed(f) => assert_eq!(f.rows_loaded, 0),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(w.get_table("sales", "orders").await.unwrap().row_count, 2);
    }

    #[tokio::test]
    async fn cancelled_bulk_load_leaves_table_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let w = setup(tmp.path()).await;
        w.create_database("sales", None).await.unwrap();
        w.create_table("sales", "orders", None).await.unwrap();
        w.load_table("sales", "orders", "etl-staging/files/orders.csv", &Value::Null)
            .await
            .unwrap();

        let mut big = String::from("id,item\n");
        for i in 0..20_000 {
            big.push_str(&format!("{},item{}\n", i, i));
        }
        w.staging
            .upload(&ObjectKey::new("etl-staging", "files", "big.csv"), big.into_bytes(), None)
            .await
            .unwrap();

        let jobs = w.jobs.clone();
        let canceller = tokio::spawn(async move {
            loop {
                let running = jobs.list(Some(JobStatus::Running), 10).await.unwrap();
                if let Some(job) = running.iter().find(|j| j.kind == "load_table") {
                    jobs.cancel(&job.id).await.unwrap();
                    return job.id.clone();
                }
                tokio::task::yield_now().await;
            }
        });
        let err = w
            .load_table("sales", "orders", "etl-staging/files/big.csv", &json!({"mode": "bulk", "batch_size": 1}))
            .await
            .unwrap_err();
        let job_id = canceller.await.unwrap();
        assert_eq!(err.kind(), ErrorKind::Cancelled);

        let details = w.get_table("sales", "orders").await.unwrap();
        assert_eq!(details.row_count, 3);
        assert_eq!(details.table.last_load_status.as_deref(), Some("cancelled"));
        let load = details.loads.iter().find(|l| l.job_id == job_id).unwrap();
        assert_eq!(load.rows_loaded, 0);
        assert_eq!(w.jobs.get(&job_id).await.unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn load_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let w = setup(tmp.path()).await;
        w.create_database("sales", None).await.unwrap();
        w.create_table("sales", "orders", None).await.unwrap();
        let err = w
            .load_table("sales", "orders", "etl-staging/files/missing.csv", &Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = w
            .load_table("sales", "nope", "etl-staging/files/orders.csv", &Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = w
            .load_table("sales", "orders", "orders.csv", &Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParams);
    }
}
