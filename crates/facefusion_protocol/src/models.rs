//! Job, Step and RunRequest models with status validation.
//!
//! `Job` is the root aggregate. The state machine is encoded in
//! [`JobStatus::valid_transitions`]; every status change goes through
//! [`Job::transition_to`], which stamps lifecycle timestamps and refuses
//! anything outside the table. Callers persist the mutated value themselves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Opaque configuration bag carried by a job (the serialised RunRequest).
pub type JobConfig = Map<String, Value>;

// ============================================================================
// Status enums
// ============================================================================

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Drafted,
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    /// States reachable from `self`. `failed -> queued` allows operator retry.
    pub fn valid_transitions(self) -> &'static [JobStatus] {
        match self {
            JobStatus::Drafted => &[JobStatus::Queued],
            JobStatus::Queued => &[JobStatus::Running, JobStatus::Canceled],
            JobStatus::Running => &[JobStatus::Completed, JobStatus::Failed, JobStatus::Canceled],
            JobStatus::Completed => &[],
            JobStatus::Failed => &[JobStatus::Queued],
            JobStatus::Canceled => &[],
        }
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Drafted => "drafted",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drafted" => Ok(JobStatus::Drafted),
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "canceled" => Ok(JobStatus::Canceled),
            _ => Err(StatusParseError(s.to_string())),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown status: {0}")]
pub struct StatusParseError(pub String);

/// Step execution states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Error taxonomy for terminal job failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Success,
    ValidationError,
    IoError,
    PathError,
    FfmpegError,
    FfmpegTimeout,
    PipelineFailed,
    ModelLoadFailed,
    CudaError,
    Canceled,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Success => "SUCCESS",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::IoError => "IO_ERROR",
            ErrorCode::PathError => "PATH_ERROR",
            ErrorCode::FfmpegError => "FFMPEG_ERROR",
            ErrorCode::FfmpegTimeout => "FFMPEG_TIMEOUT",
            ErrorCode::PipelineFailed => "PIPELINE_FAILED",
            ErrorCode::ModelLoadFailed => "MODEL_LOAD_FAILED",
            ErrorCode::CudaError => "CUDA_ERROR",
            ErrorCode::Canceled => "CANCELED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(ErrorCode::Success),
            "VALIDATION_ERROR" => Ok(ErrorCode::ValidationError),
            "IO_ERROR" => Ok(ErrorCode::IoError),
            "PATH_ERROR" => Ok(ErrorCode::PathError),
            "FFMPEG_ERROR" => Ok(ErrorCode::FfmpegError),
            "FFMPEG_TIMEOUT" => Ok(ErrorCode::FfmpegTimeout),
            "PIPELINE_FAILED" => Ok(ErrorCode::PipelineFailed),
            "MODEL_LOAD_FAILED" => Ok(ErrorCode::ModelLoadFailed),
            "CUDA_ERROR" => Ok(ErrorCode::CudaError),
            "CANCELED" => Ok(ErrorCode::Canceled),
            "INTERNAL_ERROR" => Ok(ErrorCode::InternalError),
            _ => Err(StatusParseError(s.to_string())),
        }
    }
}

// ============================================================================
// Step
// ============================================================================

/// A single processing step within a job. Steps are created by the caller;
/// the orchestrator never reorders or merges them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub index: u32,
    pub name: String,
    pub status: StepStatus,
    pub progress: f32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl Step {
    pub fn new(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            status: StepStatus::Pending,
            progress: 0.0,
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }
}

// ============================================================================
// Job
// ============================================================================

/// A persistent unit of work with lifecycle management.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: f32,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_code: Option<ErrorCode>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub config: JobConfig,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Job {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Drafted,
            progress: 0.0,
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_code: None,
            error_message: None,
            config: JobConfig::new(),
            steps: Vec::new(),
            metadata: Map::new(),
        }
    }

    /// Move to `new_status` if the transition is valid, stamping
    /// `started_at`/`completed_at` as a side effect. Returns whether the
    /// transition happened; on `false` the job is unchanged.
    pub fn transition_to(&mut self, new_status: JobStatus) -> bool {
        if !self.status.can_transition_to(new_status) {
            return false;
        }
        self.status = new_status;
        if new_status == JobStatus::Running {
            self.started_at = Some(Utc::now());
        } else if new_status.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        true
    }

    /// Raise progress to `progress`, clamped to `[0, 1]`. Lower or equal
    /// values are ignored: progress is monotonic over the job's lifetime.
    pub fn update_progress(&mut self, progress: f32) {
        let clamped = progress.clamp(0.0, 1.0);
        if clamped > self.progress {
            self.progress = clamped;
        }
    }

    /// Record an error and transition to `failed`.
    pub fn fail(&mut self, code: ErrorCode, message: impl Into<String>) {
        self.error_code = Some(code);
        self.error_message = Some(message.into());
        self.transition_to(JobStatus::Failed);
    }

    /// Scheduling priority from `metadata.priority`; absent means 0.
    pub fn priority(&self) -> i64 {
        self.metadata
            .get("priority")
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }
}

// ============================================================================
// RunRequest
// ============================================================================

/// Client request to run a processing job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub source_paths: Vec<String>,
    pub target_path: String,
    pub output_path: String,
    #[serde(default)]
    pub processors: Vec<String>,
    #[serde(default)]
    pub settings: Map<String, Value>,
    #[serde(default)]
    pub job_id: Option<String>,
}

impl RunRequest {
    /// The explicit job id, or a generated `<prefix>-<YYYYMMDD-HHMMSS>-<8-hex>`.
    pub fn generate_job_id(&self, prefix: &str) -> String {
        if let Some(id) = &self.job_id {
            return id.clone();
        }
        let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}-{}", prefix, timestamp, &uuid[..8])
    }

    /// Serialise into a job configuration bag. The named keys
    /// (`source_paths`, `target_path`, `output_path`, `processors`) win over
    /// same-named entries in the settings bag, so [`RunRequest::from_config`]
    /// inverts this exactly.
    pub fn to_config(&self) -> JobConfig {
        let mut config = self.settings.clone();
        config.insert(
            "source_paths".to_string(),
            Value::from(self.source_paths.clone()),
        );
        config.insert("target_path".to_string(), Value::from(self.target_path.clone()));
        config.insert("output_path".to_string(), Value::from(self.output_path.clone()));
        config.insert("processors".to_string(), Value::from(self.processors.clone()));
        config
    }

    /// Recover a request from a job's configuration bag.
    pub fn from_config(config: &JobConfig) -> Self {
        let string_list = |key: &str| -> Vec<String> {
            config
                .get(key)
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };
        let string_value = |key: &str| -> String {
            config
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let named = ["source_paths", "target_path", "output_path", "processors"];
        let settings = config
            .iter()
            .filter(|(key, _)| !named.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Self {
            source_paths: string_list("source_paths"),
            target_path: string_value("target_path"),
            output_path: string_value("output_path"),
            processors: string_list("processors"),
            settings,
            job_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Drafted).unwrap(),
            "\"drafted\""
        );
        assert_eq!(
            serde_json::to_string(&JobStatus::Canceled).unwrap(),
            "\"canceled\""
        );
        assert_eq!("queued".parse::<JobStatus>().unwrap(), JobStatus::Queued);
        assert!("QUEUED".parse::<JobStatus>().is_err());
    }

    #[test]
    fn error_code_wire_form() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::PipelineFailed).unwrap(),
            "\"PIPELINE_FAILED\""
        );
        assert_eq!(
            "FFMPEG_TIMEOUT".parse::<ErrorCode>().unwrap(),
            ErrorCode::FfmpegTimeout
        );
    }

    #[test]
    fn transition_table_matches_lifecycle() {
        assert!(JobStatus::Drafted.can_transition_to(JobStatus::Queued));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Canceled));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Canceled));
        assert!(JobStatus::Failed.can_transition_to(JobStatus::Queued));

        assert!(!JobStatus::Drafted.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Completed.valid_transitions().is_empty());
        assert!(JobStatus::Canceled.valid_transitions().is_empty());
    }

    #[test]
    fn transition_stamps_timestamps() {
        let mut job = Job::new("job-1");
        assert!(job.transition_to(JobStatus::Queued));
        assert!(job.started_at.is_none());

        assert!(job.transition_to(JobStatus::Running));
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_none());

        assert!(job.transition_to(JobStatus::Completed));
        assert!(job.completed_at.is_some());
        assert!(job.started_at.unwrap() <= job.completed_at.unwrap());
    }

    #[test]
    fn invalid_transition_leaves_job_unchanged() {
        let mut job = Job::new("job-1");
        assert!(!job.transition_to(JobStatus::Completed));
        assert_eq!(job.status, JobStatus::Drafted);
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn progress_is_monotonic_and_clamped() {
        let mut job = Job::new("job-1");
        job.update_progress(0.5);
        assert_eq!(job.progress, 0.5);
        job.update_progress(0.3);
        assert_eq!(job.progress, 0.5);
        job.update_progress(0.5);
        assert_eq!(job.progress, 0.5);
        job.update_progress(7.0);
        assert_eq!(job.progress, 1.0);
        job.update_progress(-1.0);
        assert_eq!(job.progress, 1.0);
    }

    #[test]
    fn fail_records_taxonomy_code() {
        let mut job = Job::new("job-1");
        job.transition_to(JobStatus::Queued);
        job.transition_to(JobStatus::Running);
        job.fail(ErrorCode::PipelineFailed, "Pipeline processing failed");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_code, Some(ErrorCode::PipelineFailed));
        assert_eq!(
            job.error_message.as_deref(),
            Some("Pipeline processing failed")
        );
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn generated_job_id_shape() {
        let request = RunRequest {
            source_paths: vec![],
            target_path: "/tmp/in.mp4".into(),
            output_path: "/tmp/out.mp4".into(),
            processors: vec![],
            settings: Map::new(),
            job_id: None,
        };
        let id = request.generate_job_id("job");
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "job");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 6);
        assert_eq!(parts[3].len(), 8);
        assert!(parts[3].chars().all(|c| c.is_ascii_hexdigit()));

        let explicit = RunRequest {
            job_id: Some("job-custom".into()),
            ..request
        };
        assert_eq!(explicit.generate_job_id("job"), "job-custom");
    }

    #[test]
    fn run_request_config_round_trip() {
        let mut settings = Map::new();
        settings.insert("face_swapper_model".to_string(), Value::from("inswapper"));
        settings.insert("output_video_quality".to_string(), Value::from(80));

        let request = RunRequest {
            source_paths: vec!["/tmp/a.jpg".into(), "/tmp/b.jpg".into()],
            target_path: "/tmp/in.mp4".into(),
            output_path: "/tmp/out.mp4".into(),
            processors: vec!["face_swapper".into(), "face_enhancer".into()],
            settings,
            job_id: None,
        };

        let config = request.to_config();
        assert_eq!(config["target_path"], Value::from("/tmp/in.mp4"));
        assert_eq!(config["face_swapper_model"], Value::from("inswapper"));

        let recovered = RunRequest::from_config(&config);
        assert_eq!(recovered.source_paths, request.source_paths);
        assert_eq!(recovered.target_path, request.target_path);
        assert_eq!(recovered.output_path, request.output_path);
        assert_eq!(recovered.processors, request.processors);
        assert_eq!(recovered.settings, request.settings);
    }

    #[test]
    fn job_serde_round_trip() {
        let mut job = Job::new("job-20260801-010203-deadbeef");
        job.steps.push(Step::new(0, "Processing"));
        job.metadata
            .insert("priority".to_string(), Value::from(5));
        job.transition_to(JobStatus::Queued);
        job.transition_to(JobStatus::Running);
        job.update_progress(0.25);

        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back.job_id, job.job_id);
        assert_eq!(back.status, job.status);
        assert_eq!(back.progress, job.progress);
        assert_eq!(back.cancel_requested, job.cancel_requested);
        assert_eq!(back.started_at, job.started_at);
        assert_eq!(back.steps.len(), 1);
        assert_eq!(back.priority(), 5);
    }
}
