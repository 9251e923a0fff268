//! Data model shared across the FaceFusion orchestrator.
//!
//! Pure types only: the job aggregate with its state machine, the error
//! taxonomy, and the event shapes that flow over the bus. Persistence and
//! scheduling live in `facefusion_db` and `facefusion_orchestrator`.

pub mod events;
pub mod models;

pub use events::{EventType, JobEvent};
pub use models::{
    ErrorCode, Job, JobConfig, JobStatus, RunRequest, StatusParseError, Step, StepStatus,
};
