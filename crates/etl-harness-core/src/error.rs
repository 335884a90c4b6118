//! Structured error taxonomy shared by every pipeline component.
//!
//! Each variant maps to one [`ErrorKind`], which the HTTP layer renders as
//! `error_kind` and the CLI prints verbatim. Multi-item failures
//! ([`PartialFailureReport`]) and bulk-load failures ([`LoadFailure`]) carry
//! enough detail for a caller to decide between retry, compensation and abort.

use serde::Serialize;
use thiserror::Error;

/// Result alias used across the core and application crates.
pub type Result<T> = std::result::Result<T, EtlError>;

/// Machine-readable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    NotFound,
    DuplicateKey,
    Conflict,
    MalformedInput,
    SyntaxError,
    Forbidden,
    UnsupportedOperation,
    InvalidParams,
    SourceUnavailable,
    PartialFailure,
    LoadFailed,
    Timeout,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::DuplicateKey => "DuplicateKey",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::MalformedInput => "MalformedInput",
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::UnsupportedOperation => "UnsupportedOperation",
            ErrorKind::InvalidParams => "InvalidParams",
            ErrorKind::SourceUnavailable => "SourceUnavailable",
            ErrorKind::PartialFailure => "PartialFailure",
            ErrorKind::LoadFailed => "LoadFailed",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one item inside a multi-item operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemStatus {
    Succeeded {
        artifact: String,
    },
    Failed {
        error_kind: ErrorKind,
        message: String,
    },
    NotAttempted,
}

/// A single named item and how it ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemOutcome {
    pub name: String,
    #[serde(flatten)]
    pub status: ItemStatus,
}

impl ItemOutcome {
    pub fn succeeded(name: impl Into<String>, artifact: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ItemStatus::Succeeded {
                artifact: artifact.into(),
            },
        }
    }

    pub fn failed(name: impl Into<String>, err: &EtlError) -> Self {
        Self {
            name: name.into(),
            status: ItemStatus::Failed {
                error_kind: err.kind(),
                message: err.to_string(),
            },
        }
    }

    pub fn not_attempted(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ItemStatus::NotAttempted,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, ItemStatus::Succeeded { .. })
    }
}

/// Per-item report for a multi-item operation where some items failed.
///
/// Artifacts written for succeeded items are not rolled back.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartialFailureReport {
    pub operation: String,
    pub job_id: Option<String>,
    pub cancelled: bool,
    pub items: Vec<ItemOutcome>,
}

impl PartialFailureReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.items.iter().filter(|i| i.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.items
            .iter()
            .filter(|i| matches!(i.status, ItemStatus::Failed { .. }))
    }

    pub fn not_attempted(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.items
            .iter()
            .filter(|i| matches!(i.status, ItemStatus::NotAttempted))
    }
}

impl std::fmt::Display for PartialFailureReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} partially failed: {} succeeded, {} failed, {} not attempted{}",
            self.operation,
            self.succeeded().count(),
            self.failed().count(),
            self.not_attempted().count(),
            if self.cancelled { " (cancelled)" } else { "" }
        )
    }
}

/// Diagnostic for a failed table load.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadFailure {
    pub database: String,
    pub table: String,
    pub job_id: String,
    /// Rows committed to the table before the failure.
    pub rows_loaded: u64,
    pub rows_total: u64,
    /// Whether the committed rows were kept (bulk mode) or rolled back.
    pub retained: bool,
    pub cause: String,
}

impl std::fmt::Display for LoadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "load into {}.{} failed after {} of {} rows ({}): {}",
            self.database,
            self.table,
            self.rows_loaded,
            self.rows_total,
            if self.retained {
                "loaded rows retained"
            } else {
                "rolled back"
            },
            self.cause
        )
    }
}

/// The error type returned by every pipeline operation.
#[derive(Debug, Error)]
pub enum EtlError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    DuplicateKey(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("SQL syntax error: {0}")]
    SyntaxError(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("{0}")]
    PartialFailure(PartialFailureReport),

    #[error("{0}")]
    LoadFailed(LoadFailure),

    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EtlError {
    pub fn not_found(what: impl Into<String>) -> Self {
        EtlError::NotFound(what.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        EtlError::InvalidParams(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        EtlError::MalformedInput(msg.into())
    }

    pub fn internal(msg: impl std::fmt::Display) -> Self {
        EtlError::Internal(msg.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EtlError::NotFound(_) => ErrorKind::NotFound,
            EtlError::DuplicateKey(_) => ErrorKind::DuplicateKey,
            EtlError::Conflict(_) => ErrorKind::Conflict,
            EtlError::MalformedInput(_) => ErrorKind::MalformedInput,
            EtlError::SyntaxError(_) => ErrorKind::SyntaxError,
            EtlError::Forbidden(_) => ErrorKind::Forbidden,
            EtlError::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            EtlError::InvalidParams(_) => ErrorKind::InvalidParams,
            EtlError::SourceUnavailable(_) => ErrorKind::SourceUnavailable,
            EtlError::PartialFailure(_) => ErrorKind::PartialFailure,
            EtlError::LoadFailed(_) => ErrorKind::LoadFailed,
            EtlError::Timeout(_) => ErrorKind::Timeout,
            EtlError::Cancelled(_) => ErrorKind::Cancelled,
            EtlError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Structured details for kinds that carry more than a message.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            EtlError::PartialFailure(report) => serde_json::to_value(report).ok(),
            EtlError::LoadFailed(failure) => serde_json::to_value(failure).ok(),
            EtlError::Timeout(ms) => Some(serde_json::json!({ "timeout_ms": ms })),
            _ => None,
        }
    }
}

impl From<csv::Error> for EtlError {
    fn from(err: csv::Error) -> Self {
        EtlError::MalformedInput(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_match_taxonomy() {
        assert_eq!(EtlError::not_found("server x").kind().as_str(), "NotFound");
        assert_eq!(EtlError::Timeout(5).kind(), ErrorKind::Timeout);
        assert_eq!(
            EtlError::DuplicateKey("bucket b".into()).to_string(),
            "bucket b already exists"
        );
    }

    #[test]
    fn partial_failure_details_list_items() {
        let report = PartialFailureReport {
            operation: "extract_database".into(),
            job_id: None,
            cancelled: false,
            items: vec![
                ItemOutcome::succeeded("t1", "staging/s.d/t1.csv"),
                ItemOutcome::failed("t2", &EtlError::SourceUnavailable("gone".into())),
                ItemOutcome::not_attempted("t3"),
            ],
        };
        let err = EtlError::PartialFailure(report);
        assert_eq!(
            err.to_string(),
            "extract_database partially failed: 1 succeeded, 1 failed, 1 not attempted"
        );
        let details = err.details().unwrap();
        let items = details["items"].as_array().unwrap();
        assert_eq!(items[0]["status"], "succeeded");
        assert_eq!(items[1]["error_kind"], "SourceUnavailable");
        assert_eq!(items[2]["status"], "not_attempted");
    }

    #[test]
    fn load_failure_reports_rows_loaded() {
        let err = EtlError::LoadFailed(LoadFailure {
            database: "dw".into(),
            table: "orders".into(),
            job_id: "j1".into(),
            rows_loaded: 2,
            rows_total: 5,
            retained: true,
            cause: "NOT NULL constraint failed".into(),
        });
        assert_eq!(err.kind(), ErrorKind::LoadFailed);
        assert_eq!(err.details().unwrap()["rows_loaded"], 2);
        assert!(err.to_string().contains("2 of 5 rows"));
    }
}
