//! Source database connectors used by the extractor.
//!
//! A [`SourceConnector`] opens one database on a registered server and
//! hands back a [`SourceDatabase`] session. The built-in [`SqlxConnector`]
//! dispatches on the server's driver:
//!
//! | driver | `host` meaning | tables read as |
//! |--------|----------------|----------------|
//! | `mysql` | hostname | `CAST(col AS CHAR)`, then type inference |
//! | `sqlite` | directory holding `<db>.db`, `.sqlite` or `.sqlite3` | native storage classes |
//!
//! Connection failures surface as `SourceUnavailable`; an unknown database
//! or table as `NotFound`.

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{Connection, Row};
use std::path::{Path, PathBuf};

use etl_harness_core::error::{EtlError, Result};
use etl_harness_core::frame::{Cell, Frame};
use etl_harness_core::models::{ServerConfig, SourceDriver};

use crate::sqlite_frame;

/// Opens sessions against source database servers.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn open(&self, server: &ServerConfig, database: &str) -> Result<Box<dyn SourceDatabase>>;
}

/// A session on one source database.
#[async_trait]
pub trait SourceDatabase: Send {
    /// Base tables, sorted by name.
    async fn list_tables(&mut self) -> Result<Vec<String>>;
    async fn table_exists(&mut self, table: &str) -> Result<bool>;
    /// Every row of `table`, in storage order.
    async fn read_table(&mut self, table: &str) -> Result<Frame>;
}

fn unavailable(server: &str, err: impl std::fmt::Display) -> EtlError {
    EtlError::SourceUnavailable(format!("{}: {}", server, err))
}

/// The sqlx-backed connector for `mysql` and `sqlite` servers.
#[derive(Debug, Default, Clone)]
pub struct SqlxConnector;

#[async_trait]
impl SourceConnector for SqlxConnector {
    async fn open(&self, server: &ServerConfig, database: &str) -> Result<Box<dyn SourceDatabase>> {
        match server.driver {
            SourceDriver::Sqlite => Ok(Box::new(SqliteSource::open(server, database).await?)),
            SourceDriver::Mysql => Ok(Box::new(MySqlSource::open(server, database).await?)),
        }
    }
}

// ============ SQLite ============

pub struct SqliteSource {
    server: String,
    conn: SqliteConnection,
}

/// Locate `<dir>/<database>.{db,sqlite,sqlite3}`.
fn resolve_sqlite_file(dir: &Path, database: &str) -> Option<PathBuf> {
    ["db", "sqlite", "sqlite3"]
        .iter()
        .map(|ext| dir.join(format!("{}.{}", database, ext)))
        .find(|p| p.is_file())
}

impl SqliteSource {
    async fn open(server: &ServerConfig, database: &str) -> Result<Self> {
        let dir = Path::new(&server.host);
        if !dir.is_dir() {
            return Err(unavailable(
                &server.server_name,
                format!("directory {} does not exist", dir.display()),
            ));
        }
        let path = resolve_sqlite_file(dir, database).ok_or_else(|| {
            EtlError::not_found(format!("database {} on server {}", database, server.server_name))
        })?;
        let options = SqliteConnectOptions::new().filename(&path).read_only(true);
        let conn = SqliteConnection::connect_with(&options)
            .await
            .map_err(|e| unavailable(&server.server_name, e))?;
        Ok(Self {
            server: server.server_name.clone(),
            conn,
        })
    }
}

#[async_trait]
impl SourceDatabase for SqliteSource {
    async fn list_tables(&mut self) -> Result<Vec<String>> {
        sqlite_frame::list_tables(&mut self.conn)
            .await
            .map_err(|e| unavailable(&self.server, e))
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        sqlite_frame::table_exists(&mut self.conn, table)
            .await
            .map_err(|e| unavailable(&self.server, e))
    }

    async fn read_table(&mut self, table: &str) -> Result<Frame> {
        sqlite_frame::read_frame(&mut self.conn, table).await
    }
}

// ============ MySQL / MariaDB ============

pub struct MySqlSource {
    server: String,
    database: String,
    conn: MySqlConnection,
}

fn quote_mysql(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// MySQL error 1049: unknown database.
fn is_unknown_database(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("1049")
        || db.message().starts_with("Unknown database"))
}

impl MySqlSource {
    async fn open(server: &ServerConfig, database: &str) -> Result<Self> {
        let options = MySqlConnectOptions::new()
            .host(&server.host)
            .port(server.port)
            .username(&server.user)
            .password(&server.password)
            .database(database);
        let conn = MySqlConnection::connect_with(&options).await.map_err(|e| {
            if is_unknown_database(&e) {
                EtlError::not_found(format!("database {} on server {}", database, server.server_name))
            } else {
                unavailable(&server.server_name, e)
            }
        })?;
        Ok(Self {
            server: server.server_name.clone(),
            database: database.to_string(),
            conn,
        })
    }

    async fn columns(&mut self, table: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT CAST(COLUMN_NAME AS CHAR) AS name FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? ORDER BY ORDINAL_POSITION",
        )
        .bind(&self.database)
        .bind(table)
        .fetch_all(&mut self.conn)
        .await
        .map_err(|e| unavailable(&self.server, e))?;
        Ok(rows.iter().map(|r| r.get::<String, _>("name")).collect())
    }
}

#[async_trait]
impl SourceDatabase for MySqlSource {
    async fn list_tables(&mut self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT CAST(TABLE_NAME AS CHAR) AS name FROM information_schema.TABLES \
             WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE' ORDER BY TABLE_NAME",
        )
        .bind(&self.database)
        .fetch_all(&mut self.conn)
        .await
        .map_err(|e| unavailable(&self.server, e))?;
        Ok(rows.iter().map(|r| r.get::<String, _>("name")).collect())
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        Ok(!self.columns(table).await?.is_empty())
    }

    async fn read_table(&mut self, table: &str) -> Result<Frame> {
        let columns = self.columns(table).await?;
        if columns.is_empty() {
            return Err(EtlError::not_found(format!("table {}.{}", self.database, table)));
        }
        let select: Vec<String> = columns
            .iter()
            .map(|c| format!("CAST({} AS CHAR)", quote_mysql(c)))
            .collect();
        let sql = format!(
            "SELECT {} FROM {}.{}",
            select.join(", "),
            quote_mysql(&self.database),
            quote_mysql(table)
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&mut self.conn)
            .await
            .map_err(|e| unavailable(&self.server, e))?;
        let cells = rows
            .iter()
            .map(|row| {
                (0..columns.len())
                    .map(|i| {
                        let value: Option<String> = row
                            .try_get(i)
                            .map_err(|e| unavailable(&self.server, e))?;
                        Ok(value.map(|v| Cell::infer(&v)).unwrap_or(Cell::Null))
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        Frame::new(columns, cells)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etl_harness_core::ErrorKind;
    use sqlx::Executor;

    fn server(host: &Path) -> ServerConfig {
        ServerConfig {
            server_name: "local".into(),
            host: host.display().to_string(),
            port: 0,
            user: String::new(),
            password: String::new(),
            driver: SourceDriver::Sqlite,
        }
    }

    async fn seed(dir: &Path) {
        let options = SqliteConnectOptions::new()
            .filename(dir.join("shop.sqlite"))
            .create_if_missing(true);
        let mut conn = SqliteConnection::connect_with(&options).await.unwrap();
        conn.execute("CREATE TABLE orders (id INTEGER, item TEXT); INSERT INTO orders VALUES (1, 'pen'), (2, 'ink');")
            .await
            .unwrap();
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn sqlite_source_reads_tables() {
        let tmp = tempfile::tempdir().unwrap();
        seed(tmp.path()).await;
        let mut db = SqlxConnector.open(&server(tmp.path()), "shop").await.unwrap();
        assert_eq!(db.list_tables().await.unwrap(), vec!["orders"]);
        assert!(db.table_exists("orders").await.unwrap());
        assert!(!db.table_exists("missing").await.unwrap());
        let frame = db.read_table("orders").await.unwrap();
        assert_eq!(frame.columns, vec!["id", "item"]);
        assert_eq!(frame.rows[1], vec![Cell::Int(2), Cell::Text("ink".into())]);
    }

    #[tokio::test]
    async fn sqlite_source_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let err = SqlxConnector.open(&server(tmp.path()), "nope").await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = SqlxConnector
            .open(&server(&tmp.path().join("absent")), "shop")
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::SourceUnavailable);
    }

    #[tokio::test]
    async fn mysql_unreachable_is_source_unavailable() {
        let cfg = ServerConfig {
            server_name: "mysql".into(),
            host: "127.0.0.1".into(),
            port: 1,
            user: "root".into(),
            password: "pw".into(),
            driver: SourceDriver::Mysql,
        };
        let err = SqlxConnector.open(&cfg, "shop").await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::SourceUnavailable);
    }
}
