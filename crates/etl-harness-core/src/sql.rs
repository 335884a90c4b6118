//! SQL statement parsing and classification.
//!
//! The query engine only runs pure reads, and relational transforms only
//! run a fixed set of data and table statements. Both gates parse with
//! `sqlparser`'s SQLite dialect before anything reaches a database.

use sqlparser::ast::{Query, SetExpr, Statement};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;

use crate::error::{EtlError, Result};

/// What a parsed statement does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    Read,
    Insert,
    Replace,
    Update,
    Delete,
    CreateTable,
    AlterTable,
    DropTable,
    /// Anything else, labelled by its leading keywords.
    Other(String),
}

impl StatementKind {
    /// Statements a relational transform may run against staged tables.
    pub fn is_transform_allowed(&self) -> bool {
        matches!(
            self,
            StatementKind::Insert
                | StatementKind::Replace
                | StatementKind::Update
                | StatementKind::Delete
                | StatementKind::CreateTable
                | StatementKind::AlterTable
                | StatementKind::DropTable
        )
    }

    pub fn label(&self) -> String {
        match self {
            StatementKind::Read => "SELECT".into(),
            StatementKind::Insert => "INSERT".into(),
            StatementKind::Replace => "REPLACE".into(),
            StatementKind::Update => "UPDATE".into(),
            StatementKind::Delete => "DELETE".into(),
            StatementKind::CreateTable => "CREATE TABLE".into(),
            StatementKind::AlterTable => "ALTER TABLE".into(),
            StatementKind::DropTable => "DROP TABLE".into(),
            StatementKind::Other(s) => s.clone(),
        }
    }
}

/// Parse SQL into statements. Unparsable or empty input fails `SyntaxError`.
pub fn parse(sql: &str) -> Result<Vec<Statement>> {
    let statements = Parser::parse_sql(&SQLiteDialect {}, sql)
        .map_err(|e| EtlError::SyntaxError(e.to_string()))?;
    if statements.is_empty() {
        return Err(EtlError::SyntaxError("no SQL statement given".into()));
    }
    Ok(statements)
}

pub fn classify(stmt: &Statement) -> StatementKind {
    if let Statement::Query(query) = stmt {
        return if query_is_read(query) {
            StatementKind::Read
        } else {
            StatementKind::Other("SELECT INTO".into())
        };
    }

    let rendered = stmt.to_string();
    let words: Vec<String> = rendered
        .split_whitespace()
        .take(4)
        .map(|w| w.to_ascii_uppercase())
        .collect();
    let word = |i: usize| words.get(i).map(String::as_str).unwrap_or("");
    match (word(0), word(1)) {
        ("INSERT", _) => StatementKind::Insert,
        ("REPLACE", _) => StatementKind::Replace,
        ("UPDATE", _) => StatementKind::Update,
        ("DELETE", _) => StatementKind::Delete,
        ("CREATE", "TABLE") => StatementKind::CreateTable,
        ("CREATE", "TEMP" | "TEMPORARY") if word(2) == "TABLE" => StatementKind::CreateTable,
        ("ALTER", "TABLE") => StatementKind::AlterTable,
        ("DROP", "TABLE") => StatementKind::DropTable,
        _ => StatementKind::Other(
            words
                .iter()
                .take(2)
                .cloned()
                .collect::<Vec<_>>()
                .join(" "),
        ),
    }
}

fn query_is_read(query: &Query) -> bool {
    let ctes_read = query
        .with
        .as_ref()
        .map(|with| with.cte_tables.iter().all(|cte| query_is_read(&cte.query)))
        .unwrap_or(true);
    ctes_read && set_expr_is_read(&query.body)
}

fn set_expr_is_read(expr: &SetExpr) -> bool {
    match expr {
        SetExpr::Select(select) => select.into.is_none(),
        SetExpr::Query(inner) => query_is_read(inner),
        SetExpr::SetOperation { left, right, .. } => set_expr_is_read(left) && set_expr_is_read(right),
        SetExpr::Values(_) | SetExpr::Table(_) => true,
        _ => false,
    }
}

/// Accept exactly one pure read statement.
///
/// `SyntaxError` if the SQL does not parse, `Forbidden` for writes, DDL,
/// session statements or more than one statement.
pub fn ensure_read_only(sql: &str) -> Result<Statement> {
    let mut statements = parse(sql)?;
    if statements.len() != 1 {
        return Err(EtlError::Forbidden(format!(
            "exactly one statement is allowed, got {}",
            statements.len()
        )));
    }
    let stmt = statements.remove(0);
    match classify(&stmt) {
        StatementKind::Read => Ok(stmt),
        other => Err(EtlError::Forbidden(format!(
            "{} is not a read-only statement",
            other.label()
        ))),
    }
}

/// Accept one or more statements from the transform allowlist.
pub fn ensure_transform_allowed(sql: &str) -> Result<Vec<StatementKind>> {
    let kinds: Vec<StatementKind> = parse(sql)?.iter().map(classify).collect();
    if let Some(bad) = kinds.iter().find(|k| !k.is_transform_allowed()) {
        return Err(EtlError::Forbidden(format!(
            "{} is not allowed in a relational transform",
            bad.label()
        )));
    }
    Ok(kinds)
}
