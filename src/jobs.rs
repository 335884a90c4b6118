//! Job records and cancellation.
//!
//! Every long-running pipeline operation (extraction, transformation, load)
//! runs as a job: a row in the catalog `jobs` table plus a
//! [`CancellationToken`] held in memory while the job runs. The operation
//! polls its token at safe points (between tables, between bulk batches,
//! before publication) and stops there when cancelled.
//!
//! A [`JobHandle`] dropped without [`JobHandle::record`] (for example when
//! the HTTP client disconnects and the handler future is dropped) marks the
//! job `abandoned`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use etl_harness_core::error::{EtlError, Result};

use crate::db::{db_err, now_iso};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed,
    Partial,
    Cancelled,
    Abandoned,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Partial => "partial",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "partial" => Ok(JobStatus::Partial),
            "cancelled" => Ok(JobStatus::Cancelled),
            "abandoned" => Ok(JobStatus::Abandoned),
            other => Err(EtlError::invalid(format!("unknown job status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: String,
    pub kind: String,
    pub target: String,
    pub status: JobStatus,
    pub detail: Option<Value>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

/// Error body stored as a failed job's detail.
pub fn error_detail(err: &EtlError) -> Value {
    serde_json::json!({
        "error_kind": err.kind(),
        "message": err.to_string(),
        "details": err.details(),
    })
}

fn status_for(err: &EtlError) -> JobStatus {
    match err {
        EtlError::PartialFailure(report) if report.cancelled => JobStatus::Cancelled,
        EtlError::PartialFailure(_) => JobStatus::Partial,
        EtlError::Cancelled(_) => JobStatus::Cancelled,
        _ => JobStatus::Failed,
    }
}

type Tokens = Arc<Mutex<HashMap<String, CancellationToken>>>;

#[derive(Clone)]
pub struct JobTracker {
    pool: SqlitePool,
    tokens: Tokens,
}

impl JobTracker {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            tokens: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record a new running job and register its cancellation token.
    pub async fn start(&self, kind: &str, target: &str) -> Result<JobHandle> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO jobs (id, kind, target, status, started_at) VALUES (?, ?, ?, 'running', ?)",
        )
        .bind(&id)
        .bind(kind)
        .bind(target)
        .bind(now_iso())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let token = CancellationToken::new();
        self.tokens_lock().insert(id.clone(), token.clone());
        info!(job = %id, kind, target, "job started");
        Ok(JobHandle {
            id,
            token,
            tracker: self.clone(),
            recorded: false,
        })
    }

    fn tokens_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub async fn get(&self, id: &str) -> Result<Job> {
        let row = sqlx::query(
            "SELECT id, kind, target, status, detail, started_at, finished_at FROM jobs WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| EtlError::not_found(format!("job '{}'", id)))?;
        row_to_job(&row)
    }

    /// Most recent jobs first.
    pub async fn list(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
        let limit = limit.clamp(1, 1000);
        let rows = match status {
            Some(s) => sqlx::query(
                "SELECT id, kind, target, status, detail, started_at, finished_at FROM jobs \
                 WHERE status = ? ORDER BY started_at DESC, rowid DESC LIMIT ?",
            )
            .bind(s.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await,
            None => sqlx::query(
                "SELECT id, kind, target, status, detail, started_at, finished_at FROM jobs \
                 ORDER BY started_at DESC, rowid DESC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await,
        }
        .map_err(db_err)?;
        rows.iter().map(row_to_job).collect()
    }

    /// Request cancellation of a running job.
    ///
    /// The job stops at its next safe point; its final status is recorded
    /// by the operation itself.
    pub async fn cancel(&self, id: &str) -> Result<Job> {
        let job = self.get(id).await?;
        if job.status != JobStatus::Running {
            return Err(EtlError::Conflict(format!(
                "job '{}' is {}, not running",
                id,
                job.status.as_str()
            )));
        }
        let token = self.tokens_lock().get(id).cloned();
        match token {
            Some(t) => {
                t.cancel();
                info!(job = %id, "cancellation requested");
                Ok(job)
            }
            None => Err(EtlError::Conflict(format!(
                "job '{}' is not running in this process",
                id
            ))),
        }
    }

    /// Mark jobs left `running` by a previous process as abandoned.
    pub async fn mark_interrupted(&self) -> Result<u64> {
        let done = sqlx::query(
            "UPDATE jobs SET status = 'abandoned', finished_at = ? WHERE status = 'running'",
        )
        .bind(now_iso())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(done.rows_affected())
    }

    async fn finish(&self, id: &str, status: JobStatus, detail: Option<Value>) -> Result<()> {
        self.tokens_lock().remove(id);
        sqlx::query("UPDATE jobs SET status = ?, detail = ?, finished_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(detail.map(|d| d.to_string()))
            .bind(now_iso())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<Job> {
    let status: String = row.get("status");
    let detail: Option<String> = row.get("detail");
    Ok(Job {
        id: row.get("id"),
        kind: row.get("kind"),
        target: row.get("target"),
        status: JobStatus::parse(&status)?,
        detail: detail.and_then(|d| serde_json::from_str(&d).ok()),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
    })
}

/// A running job. Record its outcome with [`JobHandle::record`].
pub struct JobHandle {
    id: String,
    token: CancellationToken,
    tracker: JobTracker,
    recorded: bool,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `Cancelled` once cancellation was requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(EtlError::Cancelled(format!("job {}", self.id)))
        } else {
            Ok(())
        }
    }

    /// Store the operation's outcome and final status.
    pub async fn record<T: Serialize>(mut self, result: &Result<T>) {
        self.recorded = true;
        let (status, detail) = match result {
            Ok(value) => (JobStatus::Succeeded, serde_json::to_value(value).ok()),
            Err(err) => (status_for(err), Some(error_detail(err))),
        };
        match status {
            JobStatus::Succeeded => info!(job = %self.id, "job succeeded"),
            other => warn!(job = %self.id, status = other.as_str(), "job did not succeed"),
        }
        if let Err(e) = self.tracker.finish(&self.id, status, detail).await {
            warn!(job = %self.id, error = %e, "failed to record job outcome");
        }
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        if self.recorded {
            return;
        }
        let tracker = self.tracker.clone();
        let id = std::mem::take(&mut self.id);
        tracker.tokens_lock().remove(&id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = tracker.finish(&id, JobStatus::Abandoned, None).await {
                    warn!(job = %id, error = %e, "failed to mark job abandoned");
                }
            });
        }
    }
}
