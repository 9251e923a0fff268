//! Executes one queued job end-to-end against the external pipeline.
//!
//! The pipeline is an opaque, blocking function behind the [`Pipeline`]
//! trait. It receives the job configuration and a [`JobContext`] — the only
//! channel back into the orchestrator: `report_progress` maps pipeline-local
//! progress onto the weighted global scale and `is_canceled` reads the
//! durable cancel flag. The runner persists every terminal decision before
//! returning control.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{error, warn};

use facefusion_db::JobStore;
use facefusion_protocol::{
    ErrorCode, EventType, Job, JobConfig, JobEvent, JobStatus, StepStatus,
};
use facefusion_security::{validate_input_path, validate_output_path, AllowedRoots};

use crate::bus::EventBus;
use crate::resources::{ResourceError, ResourceManager};

/// Minimum interval between persisted progress updates. Completion of a
/// phase (`local >= 1.0`) bypasses the throttle.
pub const PROGRESS_THROTTLE: Duration = Duration::from_millis(200);

/// Named portion of pipeline execution, used only for weighting progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Analysing,
    Extracting,
    Processing,
    Merging,
    Unknown,
}

impl Phase {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "analysing" => Phase::Analysing,
            "extracting" => Phase::Extracting,
            "processing" => Phase::Processing,
            "merging" => Phase::Merging,
            _ => Phase::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Analysing => "analysing",
            Phase::Extracting => "extracting",
            Phase::Processing => "processing",
            Phase::Merging => "merging",
            Phase::Unknown => "unknown",
        }
    }

    /// Map phase-local progress into this phase's window of the global
    /// scale, so job progress climbs monotonically through the pipeline.
    pub fn global_progress(self, local: f32) -> f32 {
        let local = local.clamp(0.0, 1.0);
        match self {
            Phase::Analysing => local * 0.05,
            Phase::Extracting => 0.05 + local * 0.10,
            Phase::Processing => 0.15 + local * 0.75,
            Phase::Merging => 0.90 + local * 0.10,
            Phase::Unknown => local,
        }
    }
}

/// The contract handed to the pipeline: progress reporting and cooperative
/// cancellation, nothing else.
pub struct JobContext {
    job_id: String,
    store: JobStore,
    bus: EventBus,
    handle: Handle,
    last_publish: Mutex<Option<Instant>>,
}

impl JobContext {
    pub fn new(job_id: impl Into<String>, store: JobStore, bus: EventBus, handle: Handle) -> Self {
        Self {
            job_id: job_id.into(),
            store,
            bus,
            handle,
            last_publish: Mutex::new(None),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Report pipeline-local progress in `[0, 1]` for `phase`.
    ///
    /// Updates are throttled to one per 200 ms except phase completion. The
    /// store enforces monotonicity; an update it rejects publishes nothing.
    pub fn report_progress(&self, local: f32, phase: &str) {
        let phase = Phase::parse(phase);
        let now = Instant::now();
        {
            let mut last = self
                .last_publish
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if local < 1.0 {
                if let Some(previous) = *last {
                    if now.duration_since(previous) < PROGRESS_THROTTLE {
                        return;
                    }
                }
            }
            *last = Some(now);
        }

        let global = phase.global_progress(local);
        let advanced = self
            .handle
            .block_on(self.store.update_progress(&self.job_id, global))
            .unwrap_or_else(|err| {
                warn!("progress update for job {} failed: {}", self.job_id, err);
                false
            });
        if advanced {
            self.bus
                .publish(&JobEvent::progress(&self.job_id, global, phase.as_str()));
        }
    }

    /// Read the durable cancel flag. Errors read as "not cancelled" so a
    /// transient store hiccup never aborts a healthy pipeline.
    pub fn is_canceled(&self) -> bool {
        self.handle
            .block_on(self.store.is_cancel_requested(&self.job_id))
            .unwrap_or(false)
    }

    /// Emit a log event on the bus for this job.
    pub fn log(&self, level: &str, message: &str) {
        self.bus.publish(&JobEvent::log(&self.job_id, level, message));
    }
}

/// The external media pipeline, reduced to a single blocking call.
pub trait Pipeline: Send + Sync {
    /// Process one job. Returns whether processing succeeded. Implementations
    /// should poll [`JobContext::is_canceled`] between units of work.
    fn execute(&self, config: &JobConfig, ctx: &JobContext) -> bool;
}

impl<F> Pipeline for F
where
    F: Fn(&JobConfig, &JobContext) -> bool + Send + Sync,
{
    fn execute(&self, config: &JobConfig, ctx: &JobContext) -> bool {
        self(config, ctx)
    }
}

/// Executes one job. Blocking; runs on the worker pool.
pub struct Runner {
    job: Job,
    store: JobStore,
    bus: EventBus,
    resources: ResourceManager,
    roots: AllowedRoots,
    pipeline: Arc<dyn Pipeline>,
    handle: Handle,
}

impl Runner {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        job: Job,
        store: JobStore,
        bus: EventBus,
        resources: ResourceManager,
        roots: AllowedRoots,
        pipeline: Arc<dyn Pipeline>,
        handle: Handle,
    ) -> Self {
        Self {
            job,
            store,
            bus,
            resources,
            roots,
            pipeline,
            handle,
        }
    }

    /// Run the pipeline for this job. Every terminal decision is persisted
    /// before this returns; the return value mirrors pipeline success.
    pub fn run(&mut self) -> bool {
        let job_id = self.job.job_id.clone();
        let ctx = JobContext::new(
            job_id.as_str(),
            self.store.clone(),
            self.bus.clone(),
            self.handle.clone(),
        );
        ctx.log("info", &format!("Starting job {job_id}"));

        // Path validation happens before any resource is acquired.
        if let Err(err) = self.validate_paths() {
            ctx.log("error", &err.to_string());
            self.fail_step(&err.to_string());
            self.job.fail(ErrorCode::PathError, err.to_string());
            self.persist();
            return false;
        }

        if ctx.is_canceled() {
            self.finish_canceled(&ctx);
            return false;
        }

        let _gpu = match self
            .handle
            .block_on(self.resources.acquire_gpu(&job_id, None))
        {
            Ok(guard) => guard,
            Err(err @ ResourceError::Timeout { .. }) => {
                ctx.log("error", &err.to_string());
                self.fail_step(&err.to_string());
                self.job.fail(ErrorCode::CudaError, err.to_string());
                self.persist();
                return false;
            }
            Err(err) => {
                self.fail_step(&err.to_string());
                self.job.fail(ErrorCode::InternalError, err.to_string());
                self.persist();
                return false;
            }
        };

        if let Some(step) = self.job.steps.first_mut() {
            step.status = StepStatus::Running;
            step.started_at = Some(Utc::now());
            let mut data = serde_json::Map::new();
            data.insert("step".to_string(), Value::from(step.index));
            data.insert("name".to_string(), Value::from(step.name.clone()));
            self.bus
                .publish(&JobEvent::new(&job_id, EventType::StepStarted, data));
        }
        self.persist();

        let config = self.job.config.clone();
        let pipeline = Arc::clone(&self.pipeline);
        let outcome = catch_unwind(AssertUnwindSafe(|| pipeline.execute(&config, &ctx)));

        match outcome {
            Err(panic) => {
                let traceback = panic_message(panic.as_ref());
                error!("job {} panicked: {}", job_id, traceback);
                ctx.log("error", &format!("Unexpected error: {traceback}"));
                self.job
                    .metadata
                    .insert("traceback".to_string(), Value::from(traceback.clone()));
                self.fail_step(&traceback);
                self.job
                    .fail(ErrorCode::InternalError, format!("Unexpected error: {traceback}"));
                self.persist();
                false
            }
            Ok(_) if ctx.is_canceled() => {
                self.finish_canceled(&ctx);
                false
            }
            Ok(true) => {
                ctx.log("info", "Job completed successfully");
                if let Some(step) = self.job.steps.first_mut() {
                    step.status = StepStatus::Completed;
                    step.progress = 1.0;
                    step.completed_at = Some(Utc::now());
                }
                self.job.transition_to(JobStatus::Completed);
                self.job.update_progress(1.0);
                self.persist();
                true
            }
            Ok(false) => {
                ctx.log("error", "Processing failed");
                self.fail_step("Pipeline processing failed");
                self.job
                    .fail(ErrorCode::PipelineFailed, "Pipeline processing failed");
                self.persist();
                false
            }
        }
    }

    /// Validate and normalise every path in the job configuration. The
    /// validated real paths replace the raw ones so the pipeline only ever
    /// sees resolved locations.
    fn validate_paths(&mut self) -> Result<(), facefusion_security::PathSecurityError> {
        let sources: Vec<String> = self
            .job
            .config
            .get("source_paths")
            .and_then(Value::as_array)
            .map(|paths| {
                paths
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut validated_sources = Vec::with_capacity(sources.len());
        for source in &sources {
            let real = validate_input_path(source, &self.roots)?;
            validated_sources.push(real.display().to_string());
        }

        let target = self
            .job
            .config
            .get("target_path")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let real_target = validate_input_path(&target, &self.roots)?;

        let output = self
            .job
            .config
            .get("output_path")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let real_output = validate_output_path(&output, &self.roots)?;

        self.job
            .config
            .insert("source_paths".to_string(), Value::from(validated_sources));
        self.job.config.insert(
            "target_path".to_string(),
            Value::from(real_target.display().to_string()),
        );
        self.job.config.insert(
            "output_path".to_string(),
            Value::from(real_output.display().to_string()),
        );
        Ok(())
    }

    fn finish_canceled(&mut self, ctx: &JobContext) {
        ctx.log("info", "Job canceled by user");
        if let Some(step) = self.job.steps.first_mut() {
            if step.status == StepStatus::Running {
                step.status = StepStatus::Skipped;
            }
        }
        self.job.error_code = Some(ErrorCode::Canceled);
        self.job.error_message = Some("Job canceled by user".to_string());
        self.job.transition_to(JobStatus::Canceled);
        self.persist();
    }

    fn fail_step(&mut self, message: &str) {
        if let Some(step) = self.job.steps.first_mut() {
            step.status = StepStatus::Failed;
            step.error_message = Some(message.to_string());
        }
    }

    /// Persist the job snapshot. Terminal writes are retried once; a write
    /// that still fails is logged and left for startup reconciliation.
    fn persist(&self) {
        if let Err(err) = self.handle.block_on(self.store.update_job(&self.job)) {
            if !self.job.status.is_terminal() {
                warn!("persisting job {} failed: {}", self.job.job_id, err);
                return;
            }
            warn!(
                "terminal write for job {} failed, retrying once: {}",
                self.job.job_id, err
            );
            if let Err(err) = self.handle.block_on(self.store.update_job(&self.job)) {
                error!(
                    "terminal write for job {} failed after retry: {}",
                    self.job.job_id, err
                );
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "pipeline panicked".to_string()
    }
}
