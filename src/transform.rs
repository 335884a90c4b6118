//! Transformations of staged tables.
//!
//! **Relational**: every staged CSV of `<server>.<database>` is loaded into
//! a scratch in-memory SQLite database, the statements run there in one
//! transaction, and each table that was created, changed or dropped is
//! published back as a new version (or removed) in one change set.
//!
//! **Tabular**: one [`TabularOp`] applied to the latest version of one
//! staged CSV, published as its next version.
//!
//! Failures at any step leave the staged artifacts untouched.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::SqliteConnection;
use sqlx::Connection;
use tracing::info;

use etl_harness_core::error::{EtlError, Result};
use etl_harness_core::frame::{CsvOptions, Frame};
use etl_harness_core::models::{
    validate_identifier, validate_path_segment, validate_server_name, ObjectInfo, ObjectKey,
};
use etl_harness_core::options::TransformOptions;
use etl_harness_core::sql::ensure_transform_allowed;
use etl_harness_core::transform::TabularOp;

use crate::extraction::Extractor;
use crate::jobs::{JobHandle, JobTracker};
use crate::sqlite_frame;
use crate::staging::{ChangeSet, StagingStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TableChangeKind {
    Created,
    Updated,
    Dropped,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableChange {
    pub table: String,
    pub change: TableChangeKind,
    pub rows: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelationalReport {
    pub job_id: String,
    pub server: String,
    pub database: String,
    pub statements: Vec<String>,
    pub dry_run: bool,
    pub changes: Vec<TableChange>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TabularReport {
    pub job_id: String,
    pub op: &'static str,
    pub rows_before: usize,
    pub rows_after: usize,
    pub columns: Vec<String>,
    pub artifact: ObjectInfo,
}

#[derive(Clone)]
pub struct Transformer {
    staging: StagingStore,
    jobs: JobTracker,
    bucket: String,
}

fn table_key(bucket: &str, folder: &str, table: &str) -> ObjectKey {
    ObjectKey::new(bucket, folder, format!("{}.csv", table))
}

impl Transformer {
    pub fn new(staging: StagingStore, jobs: JobTracker, bucket: impl Into<String>) -> Self {
        Self {
            staging,
            jobs,
            bucket: bucket.into(),
        }
    }

    // ============ Relational ============

    pub async fn transform_relational(
        &self,
        server: &str,
        database: &str,
        sql: &str,
        options: &Value,
    ) -> Result<RelationalReport> {
        validate_server_name(server)?;
        validate_identifier("database", database)?;
        let options = TransformOptions::from_value(options)?;
        let kinds = ensure_transform_allowed(sql)?;

        let job = self
            .jobs
            .start("transform_relational", &format!("{}/{}", server, database))
            .await?;
        let result = self
            .run_relational(&job, server, database, sql, &options, kinds.iter().map(|k| k.label()).collect())
            .await;
        job.record(&result).await;
        result
    }

    async fn run_relational(
        &self,
        job: &JobHandle,
        server: &str,
        database: &str,
        sql: &str,
        options: &TransformOptions,
        statements: Vec<String>,
    ) -> Result<RelationalReport> {
        let folder = Extractor::database_folder(server, database);
        let staged: Vec<ObjectInfo> = match self.staging.list_objects(&self.bucket, &folder).await {
            Ok(objects) => objects,
            Err(EtlError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        }
        .into_iter()
        .filter(|o| o.object.ends_with(".csv"))
        .collect();
        if staged.is_empty() {
            return Err(EtlError::not_found(format!(
                "staged tables for {}/{}",
                server, database
            )));
        }

        // Relational transforms on one folder serialize on the folder key
        // first; other writers hold at most one object key at a time.
        let locks = self.staging.locks();
        let _folder_lock = locks
            .acquire(&format!("staging-folder:{}/{}", self.bucket, folder))
            .await;
        let _existing = locks
            .acquire_many(staged.iter().map(|o| o.key().lock_key()))
            .await;

        let mut conn = SqliteConnection::connect("sqlite::memory:")
            .await
            .map_err(EtlError::internal)?;
        let mut before: BTreeMap<String, Frame> = BTreeMap::new();
        for object in &staged {
            let table = object.object.trim_end_matches(".csv").to_string();
            let (_, bytes) = self.staging.download(&object.key(), None).await?;
            let frame = Frame::from_csv(&bytes, &CsvOptions::default())?;
            sqlite_frame::write_frame(&mut conn, &table, &frame).await?;
            let loaded = sqlite_frame::read_frame(&mut conn, &table).await?;
            before.insert(table, loaded);
        }

        let after = run_statements(&mut conn, sql).await?;
        let mut changes = diff_tables(&before, &after);
        for change in &changes {
            if change.change != TableChangeKind::Dropped {
                validate_path_segment("object", &format!("{}.csv", change.table))?;
            }
        }

        if options.dry_run || changes.is_empty() {
            info!(server, database, changes = changes.len(), dry_run = options.dry_run, "relational transform evaluated");
            return Ok(self.report(job, server, database, statements, options.dry_run, changes));
        }

        let new_keys: Vec<String> = changes
            .iter()
            .filter(|c| c.change == TableChangeKind::Created)
            .map(|c| table_key(&self.bucket, &folder, &c.table).lock_key())
            .collect();
        let _created = locks.acquire_many(new_keys).await;
        job.check_cancelled()?;

        let mut set = ChangeSet::new();
        for change in &changes {
            let key = table_key(&self.bucket, &folder, &change.table);
            match change.change {
                TableChangeKind::Dropped => set.remove(key),
                _ => {
                    let frame = after
                        .get(&change.table)
                        .ok_or_else(|| EtlError::internal("changed table vanished"))?;
                    set.put(key, frame.to_csv()?, "text/csv");
                }
            }
        }
        let published = self.staging.publish(set).await?;
        for info in published {
            let table = info.object.trim_end_matches(".csv");
            if let Some(change) = changes.iter_mut().find(|c| c.table == table) {
                change.version = Some(info.version);
            }
        }
        info!(server, database, changes = changes.len(), "relational transform published");
        Ok(self.report(job, server, database, statements, false, changes))
    }

    fn report(
        &self,
        job: &JobHandle,
        server: &str,
        database: &str,
        statements: Vec<String>,
        dry_run: bool,
        changes: Vec<TableChange>,
    ) -> RelationalReport {
        RelationalReport {
            job_id: job.id().to_string(),
            server: server.to_string(),
            database: database.to_string(),
            statements,
            dry_run,
            changes,
        }
    }

    // ============ Tabular ============

    pub async fn transform_tabular(
        &self,
        bucket: &str,
        folder: &str,
        df: &str,
        op: &str,
        params: &Value,
    ) -> Result<TabularReport> {
        let op = TabularOp::from_parts(op, params)?;
        let key = self.resolve_frame_key(bucket, folder, df).await?;

        let job = self
            .jobs
            .start("transform_tabular", &format!("{} {}", key, op.name()))
            .await?;
        let result = self.run_tabular(&job, &key, &op).await;
        job.record(&result).await;
        result
    }

    /// `df` names a staged object; a bare table name resolves to `<df>.csv`.
    async fn resolve_frame_key(&self, bucket: &str, folder: &str, df: &str) -> Result<ObjectKey> {
        let key = ObjectKey::new(bucket, folder, df);
        key.validate()?;
        if self.staging.head(&key).await?.is_some() || df.ends_with(".csv") {
            return Ok(key);
        }
        let csv = table_key(bucket, folder, df);
        if self.staging.head(&csv).await?.is_some() {
            Ok(csv)
        } else {
            Ok(key)
        }
    }

    async fn run_tabular(&self, job: &JobHandle, key: &ObjectKey, op: &TabularOp) -> Result<TabularReport> {
        let _guard = self.staging.locks().acquire(&key.lock_key()).await;
        let (info, bytes) = self.staging.download(key, None).await?;
        let frame = Frame::from_csv(&bytes, &CsvOptions::default())?;
        let out = op.apply(&frame)?;
        job.check_cancelled()?;

        let mut set = ChangeSet::new();
        set.put(key.clone(), out.to_csv()?, info.content_type);
        let artifact = self
            .staging
            .publish(set)
            .await?
            .pop()
            .ok_or_else(|| EtlError::internal("tabular publication returned nothing"))?;
        info!(object = %key, op = op.name(), version = artifact.version, "tabular transform published");
        Ok(TabularReport {
            job_id: job.id().to_string(),
            op: op.name(),
            rows_before: frame.num_rows(),
            rows_after: out.num_rows(),
            columns: out.columns,
            artifact,
        })
    }
}

/// Execute the statements one by one in a single transaction and read every
/// table back.
async fn run_statements(conn: &mut SqliteConnection, sql: &str) -> Result<BTreeMap<String, Frame>> {
    let statements: Vec<String> = etl_harness_core::sql::parse(sql)?
        .iter()
        .map(|s| s.to_string())
        .collect();
    let mut tx = conn.begin().await.map_err(EtlError::internal)?;
    for statement in &statements {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .map_err(sqlite_frame::user_sql_err)?;
    }
    let mut after = BTreeMap::new();
    for table in sqlite_frame::list_tables(&mut *tx).await? {
        let frame = sqlite_frame::read_frame(&mut *tx, &table).await?;
        after.insert(table, frame);
    }
    tx.commit().await.map_err(EtlError::internal)?;
    Ok(after)
}

fn diff_tables(before: &BTreeMap<String, Frame>, after: &BTreeMap<String, Frame>) -> Vec<TableChange> {
    let mut changes = Vec::new();
    for (table, frame) in after {
        let change = match before.get(table) {
            None => Some(TableChangeKind::Created),
            Some(old) if old != frame => Some(TableChangeKind::Updated),
            Some(_) => None,
        };
        if let Some(change) = change {
            changes.push(TableChange {
                table: table.clone(),
                change,
                rows: frame.num_rows(),
                version: None,
            });
        }
    }
    for (table, frame) in before {
        if !after.contains_key(table) {
            changes.push(TableChange {
                table: table.clone(),
                change: TableChangeKind::Dropped,
                rows: frame.num_rows(),
                version: None,
            });
        }
    }
    changes
}
