use thiserror::Error;

/// Errors returned by the job store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("job already exists: {0}")]
    DuplicateJob(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row for job {job_id}: {reason}")]
    Corrupt { job_id: String, reason: String },

    #[error("database schema version {found} is newer than supported version {expected}")]
    SchemaVersion { found: i64, expected: i64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
