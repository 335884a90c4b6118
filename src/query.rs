//! Read-only SQL over warehouse databases.
//!
//! A query is exactly one statement that the SQL classifier accepts as a
//! pure read. It runs on a fresh read-only connection to the database file,
//! under a deadline, and the whole result is materialized before it is
//! returned. At most `max_rows` rows come back; `truncated` says whether
//! more were available.

use std::time::{Duration, Instant};

use futures::TryStreamExt;
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::Connection;
use tracing::{debug, warn};

use etl_harness_core::error::{EtlError, Result};
use etl_harness_core::frame::Cell;
use etl_harness_core::options::QueryOptions;
use etl_harness_core::sql::ensure_read_only;

use crate::config::WarehouseConfig;
use crate::sqlite_frame::{self, user_sql_err};
use crate::warehouse::Warehouse;

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub database: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
    pub row_count: usize,
    pub truncated: bool,
    pub elapsed_ms: u64,
}

#[derive(Clone)]
pub struct QueryEngine {
    warehouse: Warehouse,
    config: WarehouseConfig,
}

impl QueryEngine {
    pub fn new(warehouse: Warehouse, config: WarehouseConfig) -> Self {
        Self { warehouse, config }
    }

    pub async fn query(&self, database: &str, sql: &str, options: &Value) -> Result<QueryResult> {
        let options = QueryOptions::from_value(options)?;
        ensure_read_only(sql)?;
        self.warehouse.require_database(database).await?;

        let timeout_ms = options.timeout_ms.unwrap_or(self.config.query_timeout_ms);
        let max_rows = options
            .max_rows
            .unwrap_or(self.config.max_result_rows)
            .min(self.config.max_result_rows);
        let path = self.warehouse.database_path(database);

        let started = Instant::now();
        let run = async {
            let connect = SqliteConnectOptions::new().filename(&path).read_only(true);
            let mut conn = SqliteConnection::connect_with(&connect)
                .await
                .map_err(|e| EtlError::internal(format!("warehouse database '{}': {}", database, e)))?;
            let columns = sqlite_frame::statement_columns(&mut conn, sql).await?;
            let mut rows = Vec::new();
            let mut truncated = false;
            {
                let mut stream = sqlx::query(sql).fetch(&mut conn);
                while let Some(row) = stream.try_next().await.map_err(user_sql_err)? {
                    if rows.len() == max_rows {
                        truncated = true;
                        break;
                    }
                    rows.push(sqlite_frame::row_cells(&row)?);
                }
            }
            if let Err(e) = conn.close().await {
                debug!(error = %e, "closing query connection");
            }
            Ok::<_, EtlError>((columns, rows, truncated))
        };

        let (columns, rows, truncated) = match tokio::time::timeout(Duration::from_millis(timeout_ms), run).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(database, timeout_ms, "query timed out");
                return Err(EtlError::Timeout(timeout_ms));
            }
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        debug!(database, rows = rows.len(), truncated, elapsed_ms, "query complete");
        Ok(QueryResult {
            database: database.to_string(),
            row_count: rows.len(),
            columns,
            rows,
            truncated,
            elapsed_ms,
        })
    }
}
