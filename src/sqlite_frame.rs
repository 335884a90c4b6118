//! Moving frames in and out of SQLite tables.
//!
//! Shared by the relational transformer (scratch in-memory database), the
//! loader (warehouse files) and the query engine (result decoding).

use base64::Engine;
use sqlx::sqlite::{SqliteArguments, SqliteConnection, SqliteRow};
use sqlx::{Column, Executor, Row, Sqlite, Statement, ValueRef};

use etl_harness_core::error::{EtlError, Result};
use etl_harness_core::frame::{Cell, Frame};
use etl_harness_core::models::{ColumnDef, ColumnType};

type Query<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Quote an identifier for SQLite (`"name"`, inner quotes doubled).
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Map a SQLite error raised while running caller-supplied SQL.
pub fn user_sql_err(err: sqlx::Error) -> EtlError {
    let msg = match &err {
        sqlx::Error::Database(db) => db.message().to_string(),
        other => other.to_string(),
    };
    if msg.contains("syntax error") || msg.contains("incomplete input") {
        EtlError::SyntaxError(msg)
    } else if let Some(rest) = msg.strip_prefix("no such table: ") {
        EtlError::not_found(format!("table {}", rest))
    } else if msg.starts_with("no such column") {
        EtlError::invalid(msg)
    } else if msg.contains("attempt to write a readonly database") {
        EtlError::Forbidden(msg)
    } else if msg.contains("interrupted") {
        EtlError::Cancelled(msg)
    } else if is_constraint(&err) || msg.contains("database is locked") {
        EtlError::Conflict(msg)
    } else if matches!(err, sqlx::Error::Database(_)) {
        EtlError::invalid(msg)
    } else {
        EtlError::internal(msg)
    }
}

/// `SQLITE_CONSTRAINT` and its extended codes.
fn is_constraint(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            !matches!(db.kind(), sqlx::error::ErrorKind::Other)
                || db.message().contains("constraint failed")
        }
        _ => false,
    }
}

pub async fn list_tables(conn: &mut SqliteConnection) -> Result<Vec<String>> {
    let rows = sqlx::query(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(user_sql_err)?;
    Ok(rows.iter().map(|r| r.get::<String, _>("name")).collect())
}

pub async fn table_exists(conn: &mut SqliteConnection, table: &str) -> Result<bool> {
    let row = sqlx::query("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
        .bind(table)
        .fetch_optional(&mut *conn)
        .await
        .map_err(user_sql_err)?;
    Ok(row.is_some())
}

/// Declared columns of an existing table, in table order.
pub async fn table_columns(conn: &mut SqliteConnection, table: &str) -> Result<Vec<ColumnDef>> {
    let sql = format!("PRAGMA table_info({})", quote_ident(table));
    let rows = sqlx::query(&sql)
        .fetch_all(&mut *conn)
        .await
        .map_err(user_sql_err)?;
    rows.iter()
        .map(|r| {
            let name: String = r.get("name");
            let declared: String = r.get("type");
            let notnull: i64 = r.get("notnull");
            Ok(ColumnDef {
                name,
                column_type: declared_type(&declared),
                nullable: notnull == 0,
            })
        })
        .collect()
}

/// Column type for a declared SQLite type, following SQLite affinity rules.
fn declared_type(declared: &str) -> ColumnType {
    let upper = declared.to_ascii_uppercase();
    if upper.contains("INT") {
        ColumnType::Integer
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
        ColumnType::Real
    } else {
        ColumnType::Text
    }
}

pub async fn create_table(
    conn: &mut SqliteConnection,
    table: &str,
    columns: &[ColumnDef],
) -> Result<()> {
    let cols: Vec<String> = columns
        .iter()
        .map(|c| {
            format!(
                "{} {}{}",
                quote_ident(&c.name),
                c.column_type.sql(),
                if c.nullable { "" } else { " NOT NULL" }
            )
        })
        .collect();
    let sql = format!("CREATE TABLE {} ({})", quote_ident(table), cols.join(", "));
    (&mut *conn).execute(sql.as_str()).await.map_err(user_sql_err)?;
    Ok(())
}

fn bind_cell<'q>(query: Query<'q>, cell: &Cell) -> Query<'q> {
    match cell {
        Cell::Null => query.bind(None::<i64>),
        Cell::Int(v) => query.bind(*v),
        Cell::Float(v) => query.bind(*v),
        Cell::Text(s) => query.bind(s.clone()),
    }
}

fn insert_sql(table: &str, columns: &[String]) -> String {
    let names: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let params = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table),
        names.join(", "),
        params
    )
}

/// Insert rows one statement at a time and return the rowid of each.
///
/// Stops at the first failing row; the caller decides whether the rows
/// already inserted are committed.
pub async fn insert_rows(
    conn: &mut SqliteConnection,
    table: &str,
    columns: &[String],
    rows: &[Vec<Cell>],
) -> Result<Vec<i64>> {
    let sql = insert_sql(table, columns);
    let mut rowids = Vec::with_capacity(rows.len());
    for row in rows {
        let query = row.iter().fold(sqlx::query(&sql), bind_cell);
        let done = query.execute(&mut *conn).await.map_err(user_sql_err)?;
        rowids.push(done.last_insert_rowid());
    }
    Ok(rowids)
}

/// Create `table` from the frame's inferred schema and fill it.
pub async fn write_frame(conn: &mut SqliteConnection, table: &str, frame: &Frame) -> Result<()> {
    create_table(conn, table, &relaxed_schema(frame)).await?;
    insert_rows(conn, table, &frame.columns, &frame.rows).await?;
    Ok(())
}

/// Inferred schema with every column nullable, so later writes may add nulls.
fn relaxed_schema(frame: &Frame) -> Vec<ColumnDef> {
    frame
        .infer_schema()
        .into_iter()
        .map(|c| ColumnDef { nullable: true, ..c })
        .collect()
}

/// Read a whole table in rowid order.
pub async fn read_frame(conn: &mut SqliteConnection, table: &str) -> Result<Frame> {
    let columns: Vec<String> = table_columns(conn, table)
        .await?
        .into_iter()
        .map(|c| c.name)
        .collect();
    if columns.is_empty() {
        return Err(EtlError::not_found(format!("table {}", table)));
    }
    let sql = format!("SELECT * FROM {} ORDER BY rowid", quote_ident(table));
    let rows = sqlx::query(&sql)
        .fetch_all(&mut *conn)
        .await
        .map_err(user_sql_err)?;
    let cells = rows.iter().map(row_cells).collect::<Result<Vec<_>>>()?;
    Frame::new(columns, cells)
}

/// Column names a statement will produce, known even when it returns no rows.
pub async fn statement_columns(conn: &mut SqliteConnection, sql: &str) -> Result<Vec<String>> {
    let stmt = (&mut *conn).prepare(sql).await.map_err(user_sql_err)?;
    Ok(stmt.columns().iter().map(|c| c.name().to_string()).collect())
}

/// Decode every column of a row by its runtime storage class.
pub fn row_cells(row: &SqliteRow) -> Result<Vec<Cell>> {
    (0..row.len()).map(|i| decode_cell(row, i)).collect()
}

fn decode_cell(row: &SqliteRow, i: usize) -> Result<Cell> {
    let raw = row.try_get_raw(i).map_err(EtlError::internal)?;
    if raw.is_null() {
        return Ok(Cell::Null);
    }
    if let Ok(v) = row.try_get::<i64, _>(i) {
        return Ok(Cell::Int(v));
    }
    if let Ok(v) = row.try_get::<f64, _>(i) {
        return Ok(Cell::Float(v));
    }
    if let Ok(v) = row.try_get::<String, _>(i) {
        return Ok(Cell::Text(v));
    }
    let bytes: Vec<u8> = row.try_get(i).map_err(EtlError::internal)?;
    Ok(Cell::Text(base64::engine::general_purpose::STANDARD.encode(bytes)))
}
