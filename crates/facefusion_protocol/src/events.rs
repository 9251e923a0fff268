//! Event shapes published on the orchestrator bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::JobStatus;

/// Types of job events. Closed set: subscribers can match exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    JobCreated,
    JobQueued,
    JobStarted,
    JobProgress,
    JobCompleted,
    JobFailed,
    JobCanceled,
    StepStarted,
    StepProgress,
    StepCompleted,
    StepFailed,
    Log,
}

impl EventType {
    /// Terminal events end per-job subscriptions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EventType::JobCompleted | EventType::JobFailed | EventType::JobCanceled
        )
    }
}

/// An event related to a job, serialised verbatim onto SSE streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: String,
    pub event_type: EventType,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(job_id: impl Into<String>, event_type: EventType, data: Map<String, Value>) -> Self {
        Self {
            job_id: job_id.into(),
            event_type,
            data,
            timestamp: Utc::now(),
        }
    }

    /// Canonical progress event: carries `progress` and `phase`.
    pub fn progress(job_id: impl Into<String>, progress: f32, phase: &str) -> Self {
        let mut data = Map::new();
        data.insert("progress".to_string(), Value::from(progress));
        data.insert("phase".to_string(), Value::from(phase));
        Self::new(job_id, EventType::JobProgress, data)
    }

    /// Canonical status-change event: carries `status` and `message`.
    pub fn status(job_id: impl Into<String>, status: JobStatus, message: &str) -> Self {
        let event_type = match status {
            JobStatus::Drafted => EventType::JobCreated,
            JobStatus::Queued => EventType::JobQueued,
            JobStatus::Running => EventType::JobStarted,
            JobStatus::Completed => EventType::JobCompleted,
            JobStatus::Failed => EventType::JobFailed,
            JobStatus::Canceled => EventType::JobCanceled,
        };
        let mut data = Map::new();
        data.insert("status".to_string(), Value::from(status.as_str()));
        data.insert("message".to_string(), Value::from(message));
        Self::new(job_id, event_type, data)
    }

    /// Canonical log event: carries `level` and `message`.
    pub fn log(job_id: impl Into<String>, level: &str, message: &str) -> Self {
        let mut data = Map::new();
        data.insert("level".to_string(), Value::from(level));
        data.insert("message".to_string(), Value::from(message));
        Self::new(job_id, EventType::Log, data)
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }
}
