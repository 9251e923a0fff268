//! Thread-safe job store over a WAL SQLite pool.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use tracing::{info, warn};

use facefusion_protocol::{ErrorCode, Job, JobStatus, Step};

use crate::error::StoreError;
use crate::schema::init_schema;

const COLUMNS: &str = "job_id, status, progress, cancel_requested, created_at, started_at, \
     completed_at, error_code, error_message, config_json, steps_json, metadata_json";

/// Persistent, thread-safe store for jobs.
///
/// Clone is cheap and shares the underlying pool.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Open (or create) the database at `db_path` and bring the schema up to
    /// date. Enables WAL so readers never block the single writer.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        init_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Insert a new job. Fails with [`StoreError::DuplicateJob`] on an id
    /// collision.
    pub async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, status, progress, cancel_requested,
                created_at, started_at, completed_at,
                error_code, error_message,
                config_json, steps_json, metadata_json
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.job_id)
        .bind(job.status.as_str())
        .bind(job.progress as f64)
        .bind(job.cancel_requested as i64)
        .bind(job.created_at.to_rfc3339())
        .bind(job.started_at.map(|t| t.to_rfc3339()))
        .bind(job.completed_at.map(|t| t.to_rfc3339()))
        .bind(job.error_code.map(|c| c.as_str()))
        .bind(&job.error_message)
        .bind(serde_json::to_string(&job.config)?)
        .bind(serde_json::to_string(&job.steps)?)
        .bind(serde_json::to_string(&job.metadata)?)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(StoreError::DuplicateJob(job.job_id.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Write the full row image for an existing job. Unknown ids are a no-op.
    ///
    /// `progress` is guarded here too: the stored value is only replaced when
    /// the new one is at least as large, so a stale snapshot can never roll
    /// a job's progress backwards.
    pub async fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE jobs SET
                status = ?,
                progress = MAX(progress, ?),
                cancel_requested = MAX(cancel_requested, ?),
                started_at = ?,
                completed_at = ?,
                error_code = ?,
                error_message = ?,
                config_json = ?,
                steps_json = ?,
                metadata_json = ?
            WHERE job_id = ?
            "#,
        )
        .bind(job.status.as_str())
        .bind(job.progress as f64)
        .bind(job.cancel_requested as i64)
        .bind(job.started_at.map(|t| t.to_rfc3339()))
        .bind(job.completed_at.map(|t| t.to_rfc3339()))
        .bind(job.error_code.map(|c| c.as_str()))
        .bind(&job.error_message)
        .bind(serde_json::to_string(&job.config)?)
        .bind(serde_json::to_string(&job.steps)?)
        .bind(serde_json::to_string(&job.metadata)?)
        .bind(&job.job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch a job by id.
    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM jobs WHERE job_id = ?");
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_job).transpose()
    }

    /// List jobs newest-first, optionally filtered by status.
    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: u32,
    ) -> Result<Vec<Job>, StoreError> {
        let rows: Vec<JobRow> = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {COLUMNS} FROM jobs WHERE status = ? \
                     ORDER BY created_at DESC LIMIT ?"
                );
                sqlx::query_as(&sql)
                    .bind(status.as_str())
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql =
                    format!("SELECT {COLUMNS} FROM jobs ORDER BY created_at DESC LIMIT ?");
                sqlx::query_as(&sql)
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(row_to_job).collect()
    }

    /// Delete a job. Only terminal rows may be removed; a live job returns
    /// `false` and stays put.
    pub async fn delete_job(&self, job_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE job_id = ? \
             AND status IN ('completed', 'failed', 'canceled')",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Durably request cancellation. Idempotent; the flag never clears.
    pub async fn set_cancel_requested(&self, job_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE jobs SET cancel_requested = 1 WHERE job_id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Read the cancel flag. Unknown jobs read as not cancelled.
    pub async fn is_cancel_requested(&self, job_id: &str) -> Result<bool, StoreError> {
        let flag: Option<i64> =
            sqlx::query_scalar("SELECT cancel_requested FROM jobs WHERE job_id = ?")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(flag.unwrap_or(0) != 0)
    }

    /// Raise a job's progress. The monotonicity invariant lives in the
    /// statement itself: the row changes only when the new value is strictly
    /// greater, and the result says whether it did.
    pub async fn update_progress(&self, job_id: &str, progress: f32) -> Result<bool, StoreError> {
        let clamped = progress.clamp(0.0, 1.0) as f64;
        let result = sqlx::query("UPDATE jobs SET progress = ? WHERE job_id = ? AND progress < ?")
            .bind(clamped)
            .bind(job_id)
            .bind(clamped)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Queued jobs in dispatch order: highest `metadata.priority` first,
    /// oldest first within a priority band. Computed in SQL so queued order
    /// survives a crash.
    pub async fn list_queued(&self) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM jobs WHERE status = 'queued' \
             ORDER BY COALESCE(json_extract(metadata_json, '$.priority'), 0) DESC, \
                      created_at ASC"
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_job).collect()
    }

    /// Per-status counters for the aggregate status endpoint.
    pub async fn count_by_status(&self) -> Result<StatusCounts, StoreError> {
        let counts: StatusCounts = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'drafted') AS drafted,
                COUNT(*) FILTER (WHERE status = 'queued') AS queued,
                COUNT(*) FILTER (WHERE status = 'running') AS running,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'canceled') AS canceled
            FROM jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(counts)
    }

    /// Reconcile rows left `running` by a dead process. Called once at
    /// startup, before any worker exists, so every such row is an orphan.
    pub async fn reconcile_orphans(&self) -> Result<u64, StoreError> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = 'failed',
                error_code = 'INTERNAL_ERROR',
                error_message = 'orphaned',
                completed_at = ?
            WHERE status = 'running'
            "#,
        )
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let orphaned = result.rows_affected();
        if orphaned > 0 {
            warn!("reconciled {} orphaned running job(s) to failed", orphaned);
        }
        Ok(orphaned)
    }

    /// Close the pool, flushing WAL state.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("job store closed");
    }
}

/// Aggregate per-status job counts.
#[derive(Debug, Clone, Copy, FromRow, serde::Serialize)]
pub struct StatusCounts {
    pub drafted: i64,
    pub queued: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub canceled: i64,
}

#[derive(Debug, FromRow)]
struct JobRow {
    job_id: String,
    status: String,
    progress: f64,
    cancel_requested: i64,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
    config_json: Option<String>,
    steps_json: Option<String>,
    metadata_json: Option<String>,
}

fn row_to_job(row: JobRow) -> Result<Job, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        job_id: row.job_id.clone(),
        reason,
    };

    let status = JobStatus::from_str(&row.status).map_err(|e| corrupt(e.to_string()))?;
    let error_code = row
        .error_code
        .as_deref()
        .map(ErrorCode::from_str)
        .transpose()
        .map_err(|e| corrupt(e.to_string()))?;

    let parse_ts = |value: &str| -> Result<DateTime<Utc>, StoreError> {
        DateTime::parse_from_rfc3339(value)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| corrupt(format!("bad timestamp {value:?}: {e}")))
    };

    let created_at = parse_ts(&row.created_at)?;
    let started_at = row.started_at.as_deref().map(parse_ts).transpose()?;
    let completed_at = row.completed_at.as_deref().map(parse_ts).transpose()?;

    let config = match row.config_json.as_deref() {
        Some(json) => serde_json::from_str(json)?,
        None => Default::default(),
    };
    let steps: Vec<Step> = match row.steps_json.as_deref() {
        Some(json) => serde_json::from_str(json)?,
        None => Vec::new(),
    };
    let metadata = match row.metadata_json.as_deref() {
        Some(json) => serde_json::from_str(json)?,
        None => Default::default(),
    };

    Ok(Job {
        job_id: row.job_id,
        status,
        progress: row.progress as f32,
        cancel_requested: row.cancel_requested != 0,
        created_at,
        started_at,
        completed_at,
        error_code,
        error_message: row.error_message,
        config,
        steps,
        metadata,
    })
}
