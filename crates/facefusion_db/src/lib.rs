//! Durable SQLite persistence for jobs.
//!
//! One writer-serialised WAL database per orchestrator (`orchestrator.db`
//! under the jobs directory). The store owns the rows: in-memory `Job`
//! values elsewhere are snapshots, and every mutation here is a full-row
//! transaction.

mod error;
mod schema;
mod store;

pub use error::StoreError;
pub use schema::SCHEMA_VERSION;
pub use store::{JobStore, StatusCounts};
