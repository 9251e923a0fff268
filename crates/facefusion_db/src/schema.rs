//! Schema creation and versioned migrations.
//!
//! The database is self-describing: a `schema_version` table guards every
//! open. A fresh file gets the full schema and the current version in one
//! transaction; an older version runs the forward-only migration chain; a
//! newer version is refused rather than read.

use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::info;

use crate::error::StoreError;

/// Current schema version. Increment when the schema changes and add a
/// migration step in [`migrate`].
pub const SCHEMA_VERSION: i64 = 1;

const CREATE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS jobs (
    job_id           TEXT PRIMARY KEY,
    status           TEXT NOT NULL DEFAULT 'drafted',
    progress         REAL DEFAULT 0.0,
    cancel_requested INTEGER DEFAULT 0,
    created_at       TEXT NOT NULL,
    started_at       TEXT,
    completed_at     TEXT,
    error_code       TEXT,
    error_message    TEXT,
    config_json      TEXT,
    steps_json       TEXT,
    metadata_json    TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);
"#;

/// Ensure the schema exists and matches [`SCHEMA_VERSION`].
pub(crate) async fn init_schema(pool: &SqlitePool) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;

    let version_table_exists: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
    )
    .fetch_optional(&mut *tx)
    .await?;

    if version_table_exists.is_none() {
        create_tables(&mut tx).await?;
        tx.commit().await?;
        return Ok(());
    }

    let current: Option<i64> = sqlx::query_scalar("SELECT version FROM schema_version")
        .fetch_optional(&mut *tx)
        .await?;
    let current = current.unwrap_or(0);

    if current > SCHEMA_VERSION {
        return Err(StoreError::SchemaVersion {
            found: current,
            expected: SCHEMA_VERSION,
        });
    }
    if current < SCHEMA_VERSION {
        migrate(&mut tx, current).await?;
        info!("migrated job store schema {} -> {}", current, SCHEMA_VERSION);
    }

    tx.commit().await?;
    Ok(())
}

async fn create_tables(tx: &mut Transaction<'_, Sqlite>) -> Result<(), StoreError> {
    sqlx::raw_sql(CREATE_SQL).execute(&mut **tx).await?;
    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Forward-only migration chain from `from_version` to [`SCHEMA_VERSION`].
async fn migrate(tx: &mut Transaction<'_, Sqlite>, from_version: i64) -> Result<(), StoreError> {
    // Version 0 predates the version row itself; the v1 schema is additive
    // over it, so creating missing tables is the whole step.
    if from_version < 1 {
        sqlx::raw_sql(CREATE_SQL).execute(&mut **tx).await?;
    }

    sqlx::query("DELETE FROM schema_version")
        .execute(&mut **tx)
        .await?;
    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(&mut **tx)
        .await?;
    Ok(())
}
