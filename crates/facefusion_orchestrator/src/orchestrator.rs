//! The front door: submission, queuing, execution and cancellation.
//!
//! One long-lived [`Orchestrator`] value is constructed at process start and
//! handed by reference to every caller. It owns the worker pool; workers
//! re-read jobs from the store at pickup and never trust a task payload.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use facefusion_db::{JobStore, StatusCounts, StoreError};
use facefusion_protocol::{
    ErrorCode, Job, JobEvent, JobStatus, RunRequest, Step,
};
use facefusion_security::AllowedRoots;

use crate::bus::EventBus;
use crate::resources::ResourceManager;
use crate::runner::{Pipeline, Runner};

const JOB_ID_PREFIX: &str = "job";

/// Errors surfaced by orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

struct Inner {
    store: JobStore,
    bus: EventBus,
    resources: ResourceManager,
    roots: AllowedRoots,
    pipeline: Arc<dyn Pipeline>,
    workers: Arc<Semaphore>,
    tracker: TaskTracker,
    active: Mutex<HashSet<String>>,
    accepting: AtomicBool,
}

/// Thread-safe handle to the orchestrator. Clones share all state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Build the orchestrator and reconcile crash leftovers: any row still
    /// `running` has no live worker yet and is marked failed/orphaned.
    pub async fn new(
        store: JobStore,
        bus: EventBus,
        resources: ResourceManager,
        roots: AllowedRoots,
        pipeline: Arc<dyn Pipeline>,
    ) -> Result<Self, OrchestratorError> {
        store.reconcile_orphans().await?;
        let worker_count = resources.cpu_worker_count();
        info!("orchestrator starting with {} worker slot(s)", worker_count);
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                bus,
                resources,
                roots,
                pipeline,
                workers: Arc::new(Semaphore::new(worker_count)),
                tracker: TaskTracker::new(),
                active: Mutex::new(HashSet::new()),
                accepting: AtomicBool::new(true),
            }),
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.inner.resources
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    /// Create a job from `request`, publish `job_created` and auto-queue it.
    /// Returns the job id.
    pub async fn submit(&self, request: RunRequest) -> Result<String, OrchestratorError> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ShuttingDown);
        }

        let job_id = request.generate_job_id(JOB_ID_PREFIX);
        let mut job = Job::new(&job_id);
        job.config = request.to_config();
        job.metadata.insert(
            "client".to_string(),
            serde_json::Value::from("orchestrator"),
        );
        job.steps.push(Step::new(0, "Processing"));

        self.inner.store.create_job(&job).await?;
        self.inner
            .bus
            .publish(&JobEvent::status(&job_id, JobStatus::Drafted, "Job created"));

        self.queue_job(&job_id).await?;
        Ok(job_id)
    }

    /// Valid transition `drafted -> queued` (or `failed -> queued` for a
    /// retry). Returns whether the job moved.
    pub async fn queue_job(&self, job_id: &str) -> Result<bool, OrchestratorError> {
        let Some(mut job) = self.inner.store.get_job(job_id).await? else {
            return Ok(false);
        };
        if !job.transition_to(JobStatus::Queued) {
            return Ok(false);
        }
        self.inner.store.update_job(&job).await?;
        self.inner
            .bus
            .publish(&JobEvent::status(job_id, JobStatus::Queued, ""));
        Ok(true)
    }

    /// Operator escape hatch: revert a queued job to `drafted`. This is a
    /// store-level reset, deliberately outside the runtime state machine.
    pub async fn unqueue_job(&self, job_id: &str) -> Result<bool, OrchestratorError> {
        let Some(mut job) = self.inner.store.get_job(job_id).await? else {
            return Ok(false);
        };
        if job.status != JobStatus::Queued {
            return Ok(false);
        }
        job.status = JobStatus::Drafted;
        self.inner.store.update_job(&job).await?;
        Ok(true)
    }

    /// Submit a queued job to the worker pool. Non-blocking: the job runs
    /// when a worker slot frees up.
    pub async fn run_job(&self, job_id: &str) -> Result<bool, OrchestratorError> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let Some(job) = self.inner.store.get_job(job_id).await? else {
            warn!("cannot run non-existent job {}", job_id);
            return Ok(false);
        };
        if job.status != JobStatus::Queued {
            warn!("cannot run job {} in status {}", job_id, job.status);
            return Ok(false);
        }
        self.spawn_worker(job_id);
        Ok(true)
    }

    /// Dispatch every queued job, highest priority first.
    pub async fn run_all_queued(&self) -> Result<u32, OrchestratorError> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let queued = self.inner.store.list_queued().await?;
        let mut count = 0;
        for job in queued {
            self.spawn_worker(&job.job_id);
            count += 1;
        }
        Ok(count)
    }

    /// Request cancellation. Sets the durable flag and publishes a notice;
    /// never blocks on a running worker. Cancelling a terminal job is a
    /// no-op that still reports success.
    pub async fn cancel_job(&self, job_id: &str) -> Result<bool, OrchestratorError> {
        let Some(job) = self.inner.store.get_job(job_id).await? else {
            return Ok(false);
        };
        if job.status.is_terminal() {
            return Ok(true);
        }
        self.inner.store.set_cancel_requested(job_id).await?;
        self.inner
            .bus
            .publish(&JobEvent::log(job_id, "info", "cancel requested"));
        Ok(true)
    }

    /// Cancel every running and queued job; returns how many were flagged.
    pub async fn cancel_active(&self) -> Result<u32, OrchestratorError> {
        let mut targets = self
            .inner
            .store
            .list_jobs(Some(JobStatus::Running), u32::MAX)
            .await?;
        targets.extend(
            self.inner
                .store
                .list_jobs(Some(JobStatus::Queued), u32::MAX)
                .await?,
        );

        let mut count = 0;
        for job in targets {
            if self.cancel_job(&job.job_id).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Current stored snapshot.
    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>, OrchestratorError> {
        Ok(self.inner.store.get_job(job_id).await?)
    }

    /// Newest-first listing, optionally filtered by status.
    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: u32,
    ) -> Result<Vec<Job>, OrchestratorError> {
        Ok(self.inner.store.list_jobs(status, limit).await?)
    }

    /// Delete a terminal job.
    pub async fn delete_job(&self, job_id: &str) -> Result<bool, OrchestratorError> {
        Ok(self.inner.store.delete_job(job_id).await?)
    }

    /// Update `metadata.priority` used by the dequeue ordering.
    pub async fn set_priority(
        &self,
        job_id: &str,
        priority: i64,
    ) -> Result<bool, OrchestratorError> {
        let Some(mut job) = self.inner.store.get_job(job_id).await? else {
            return Ok(false);
        };
        job.metadata
            .insert("priority".to_string(), serde_json::Value::from(priority));
        self.inner.store.update_job(&job).await?;
        Ok(true)
    }

    /// Aggregate per-status counters.
    pub async fn status_counts(&self) -> Result<StatusCounts, OrchestratorError> {
        Ok(self.inner.store.count_by_status().await?)
    }

    /// Stop accepting work, drain in-flight workers and close the store.
    pub async fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.store.close().await;
        info!("orchestrator shut down");
    }

    fn spawn_worker(&self, job_id: &str) {
        let inner = Arc::clone(&self.inner);
        let job_id = job_id.to_string();
        self.inner.tracker.spawn(async move {
            execute_job(inner, job_id).await;
        });
    }
}

/// Worker body: claims a pool slot and runs the §4.F contract for one job.
async fn execute_job(inner: Arc<Inner>, job_id: String) {
    let Ok(_permit) = Arc::clone(&inner.workers).acquire_owned().await else {
        return;
    };

    {
        let mut active = lock_active(&inner);
        if !active.insert(job_id.clone()) {
            // Another worker already owns this job.
            return;
        }
    }

    run_worker(&inner, &job_id).await;

    inner.resources.release_all(&job_id);
    lock_active(&inner).remove(&job_id);
}

async fn run_worker(inner: &Arc<Inner>, job_id: &str) {
    // Re-read the job; the task payload is just an id.
    let job = match inner.store.get_job(job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => return,
        Err(err) => {
            error!("worker failed to load job {}: {}", job_id, err);
            return;
        }
    };

    // Cancelled while queued: transition without acquiring anything.
    let cancel_requested = inner
        .store
        .is_cancel_requested(job_id)
        .await
        .unwrap_or(false);
    if cancel_requested {
        let mut job = job;
        if job.status.can_transition_to(JobStatus::Canceled) {
            job.error_code = Some(ErrorCode::Canceled);
            job.error_message = Some("Job canceled by user".to_string());
            job.transition_to(JobStatus::Canceled);
            persist_terminal(inner, &job).await;
            inner.bus.publish(&JobEvent::status(
                job_id,
                JobStatus::Canceled,
                "Job canceled by user",
            ));
        }
        return;
    }

    let mut job = job;
    if !job.transition_to(JobStatus::Running) {
        warn!("cannot start job {} in status {}", job_id, job.status);
        return;
    }
    if let Err(err) = inner.store.update_job(&job).await {
        error!("failed to mark job {} running: {}", job_id, err);
        return;
    }
    inner
        .bus
        .publish(&JobEvent::status(job_id, JobStatus::Running, ""));

    let mut runner = Runner::new(
        job,
        inner.store.clone(),
        inner.bus.clone(),
        inner.resources.clone(),
        inner.roots.clone(),
        Arc::clone(&inner.pipeline),
        Handle::current(),
    );
    if let Err(err) = tokio::task::spawn_blocking(move || runner.run()).await {
        error!("worker for job {} aborted: {}", job_id, err);
    }

    // Defend against a pipeline that exited without a final status.
    match inner.store.get_job(job_id).await {
        Ok(Some(mut final_job)) => {
            if final_job.status == JobStatus::Running {
                final_job.fail(
                    ErrorCode::PipelineFailed,
                    "Pipeline exited without setting final status",
                );
                persist_terminal(inner, &final_job).await;
            }
            let message = final_job.error_message.clone().unwrap_or_default();
            inner
                .bus
                .publish(&JobEvent::status(job_id, final_job.status, &message));
        }
        Ok(None) => {}
        Err(err) => error!("failed to reconcile job {}: {}", job_id, err),
    }
}

/// Terminal writes get one internal retry before being left to startup
/// reconciliation.
async fn persist_terminal(inner: &Arc<Inner>, job: &Job) {
    if let Err(err) = inner.store.update_job(job).await {
        warn!(
            "terminal write for job {} failed, retrying once: {}",
            job.job_id, err
        );
        if let Err(err) = inner.store.update_job(job).await {
            error!(
                "terminal write for job {} failed after retry: {}",
                job.job_id, err
            );
        }
    }
}

fn lock_active(inner: &Arc<Inner>) -> std::sync::MutexGuard<'_, HashSet<String>> {
    inner
        .active
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
