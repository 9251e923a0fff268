//! End-to-end orchestration scenarios against a real store and worker pool.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Map;
use tempfile::TempDir;

use facefusion_db::JobStore;
use facefusion_orchestrator::{
    EventBus, EventStream, Orchestrator, Pipeline, ResourceLimits, ResourceManager,
};
use facefusion_protocol::{ErrorCode, EventType, Job, JobStatus, RunRequest, StepStatus};
use facefusion_security::AllowedRoots;

struct TestEnv {
    _dir: TempDir,
    workspace: PathBuf,
    orchestrator: Orchestrator,
    events: EventStream,
}

async fn start(pipeline: Arc<dyn Pipeline>, limits: ResourceLimits) -> TestEnv {
    let dir = TempDir::new().unwrap();
    let workspace = dir.path().join("workspace");
    std::fs::create_dir_all(&workspace).unwrap();

    let store = JobStore::open(&dir.path().join("orchestrator.db"))
        .await
        .unwrap();
    let bus = EventBus::new();
    let events = bus.subscribe_all();
    let resources = ResourceManager::new(limits);
    let roots = AllowedRoots::new([&workspace]);
    let orchestrator = Orchestrator::new(store, bus, resources, roots, pipeline)
        .await
        .unwrap();

    TestEnv {
        _dir: dir,
        workspace,
        orchestrator,
        events,
    }
}

fn request(workspace: &Path) -> RunRequest {
    let target = workspace.join("target.mp4");
    std::fs::write(&target, b"fake video").unwrap();
    RunRequest {
        source_paths: vec![],
        target_path: target.display().to_string(),
        output_path: workspace.join("out.mp4").display().to_string(),
        processors: vec!["face_swapper".to_string()],
        settings: Map::new(),
        job_id: None,
    }
}

async fn wait_terminal(orchestrator: &Orchestrator, job_id: &str) -> Job {
    for _ in 0..400 {
        let job = orchestrator.get_job(job_id).await.unwrap().unwrap();
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} did not reach a terminal state");
}

/// Drain events for `job_id` (in publication order) until its terminal event.
async fn drain_events(events: &mut EventStream, job_id: &str) -> Vec<(EventType, Map<String, serde_json::Value>)> {
    let mut collected = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .expect("timed out waiting for events")
            .expect("event stream ended unexpectedly");
        if event.job_id != job_id {
            continue;
        }
        let terminal = event.is_terminal();
        collected.push((event.event_type, event.data));
        if terminal {
            return collected;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_path_publishes_lifecycle_in_order() {
    let pipeline = Arc::new(|_: &facefusion_protocol::JobConfig, ctx: &facefusion_orchestrator::JobContext| {
        ctx.report_progress(0.0, "analysing");
        ctx.report_progress(1.0, "merging");
        true
    });
    let mut env = start(pipeline, ResourceLimits::default()).await;

    let job_id = env
        .orchestrator
        .submit(request(&env.workspace))
        .await
        .unwrap();
    assert!(env.orchestrator.run_job(&job_id).await.unwrap());

    let job = wait_terminal(&env.orchestrator, &job_id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 1.0);
    assert!(job.completed_at.is_some());
    assert_eq!(job.steps[0].status, StepStatus::Completed);
    assert_eq!(job.steps[0].progress, 1.0);

    let events = drain_events(&mut env.events, &job_id).await;
    let lifecycle: Vec<EventType> = events
        .iter()
        .map(|(event_type, _)| *event_type)
        .filter(|event_type| {
            matches!(
                event_type,
                EventType::JobCreated
                    | EventType::JobQueued
                    | EventType::JobStarted
                    | EventType::JobProgress
                    | EventType::JobCompleted
            )
        })
        .collect();
    assert_eq!(
        lifecycle,
        vec![
            EventType::JobCreated,
            EventType::JobQueued,
            EventType::JobStarted,
            EventType::JobProgress,
            EventType::JobCompleted,
        ]
    );

    let (_, progress_data) = events
        .iter()
        .rev()
        .find(|(event_type, _)| *event_type == EventType::JobProgress)
        .unwrap();
    assert_eq!(progress_data["progress"].as_f64().unwrap(), 1.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_while_queued_never_runs_the_pipeline() {
    let ran = Arc::new(AtomicBool::new(false));
    let ran_in_pipeline = Arc::clone(&ran);
    let pipeline = Arc::new(move |_: &facefusion_protocol::JobConfig, _: &facefusion_orchestrator::JobContext| {
        ran_in_pipeline.store(true, Ordering::SeqCst);
        true
    });
    let mut env = start(pipeline, ResourceLimits::default()).await;

    let job_id = env
        .orchestrator
        .submit(request(&env.workspace))
        .await
        .unwrap();
    assert!(env.orchestrator.cancel_job(&job_id).await.unwrap());
    assert!(env.orchestrator.run_job(&job_id).await.unwrap());

    let job = wait_terminal(&env.orchestrator, &job_id).await;
    assert_eq!(job.status, JobStatus::Canceled);
    assert!(job.cancel_requested);
    assert_eq!(job.error_code, Some(ErrorCode::Canceled));
    assert!(!ran.load(Ordering::SeqCst));

    let events = drain_events(&mut env.events, &job_id).await;
    assert!(events
        .iter()
        .all(|(event_type, _)| *event_type != EventType::JobProgress));
    assert_eq!(events.last().unwrap().0, EventType::JobCanceled);

    // No resource was ever acquired.
    let status = env.orchestrator.resources().status();
    assert_eq!(status.gpu.available, status.gpu.max);
    assert!(status.active_jobs.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_while_running_is_cooperative() {
    let pipeline = Arc::new(|_: &facefusion_protocol::JobConfig, ctx: &facefusion_orchestrator::JobContext| {
        ctx.report_progress(0.5, "processing");
        for _ in 0..500 {
            if ctx.is_canceled() {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        true
    });
    let mut env = start(pipeline, ResourceLimits::default()).await;

    let job_id = env
        .orchestrator
        .submit(request(&env.workspace))
        .await
        .unwrap();
    assert!(env.orchestrator.run_job(&job_id).await.unwrap());

    // Wait for the weighted 0.5-in-processing sample to land.
    for _ in 0..400 {
        let job = env.orchestrator.get_job(&job_id).await.unwrap().unwrap();
        if job.progress > 0.5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(env.orchestrator.cancel_job(&job_id).await.unwrap());
    let job = wait_terminal(&env.orchestrator, &job_id).await;
    assert_eq!(job.status, JobStatus::Canceled);
    assert!(job.progress <= 0.525 + 1e-6);

    let events = drain_events(&mut env.events, &job_id).await;
    assert_eq!(events.last().unwrap().0, EventType::JobCanceled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pipeline_failure_is_taxonomy_coded() {
    let pipeline = Arc::new(|_: &facefusion_protocol::JobConfig, _: &facefusion_orchestrator::JobContext| false);
    let mut env = start(pipeline, ResourceLimits::default()).await;

    let job_id = env
        .orchestrator
        .submit(request(&env.workspace))
        .await
        .unwrap();
    assert!(env.orchestrator.run_job(&job_id).await.unwrap());

    let job = wait_terminal(&env.orchestrator, &job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_code, Some(ErrorCode::PipelineFailed));
    assert_eq!(
        job.error_message.as_deref(),
        Some("Pipeline processing failed")
    );
    assert_eq!(job.steps[0].status, StepStatus::Failed);

    let events = drain_events(&mut env.events, &job_id).await;
    let (event_type, data) = events.last().unwrap();
    assert_eq!(*event_type, EventType::JobFailed);
    assert_eq!(data["message"], serde_json::json!("Pipeline processing failed"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pipeline_panic_is_internal_error_with_traceback() {
    let pipeline = Arc::new(|_: &facefusion_protocol::JobConfig, _: &facefusion_orchestrator::JobContext| -> bool {
        panic!("model exploded")
    });
    let env = start(pipeline, ResourceLimits::default()).await;

    let job_id = env
        .orchestrator
        .submit(request(&env.workspace))
        .await
        .unwrap();
    assert!(env.orchestrator.run_job(&job_id).await.unwrap());

    let job = wait_terminal(&env.orchestrator, &job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_code, Some(ErrorCode::InternalError));
    assert_eq!(
        job.metadata["traceback"],
        serde_json::json!("model exploded")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn traversal_target_fails_without_touching_resources() {
    let ran = Arc::new(AtomicBool::new(false));
    let ran_in_pipeline = Arc::clone(&ran);
    let pipeline = Arc::new(move |_: &facefusion_protocol::JobConfig, _: &facefusion_orchestrator::JobContext| {
        ran_in_pipeline.store(true, Ordering::SeqCst);
        true
    });
    let env = start(pipeline, ResourceLimits::default()).await;

    let mut bad = request(&env.workspace);
    bad.target_path = "/etc/passwd".to_string();
    let job_id = env.orchestrator.submit(bad).await.unwrap();
    assert!(env.orchestrator.run_job(&job_id).await.unwrap());

    let job = wait_terminal(&env.orchestrator, &job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_code, Some(ErrorCode::PathError));
    assert!(!ran.load(Ordering::SeqCst));

    let status = env.orchestrator.resources().status();
    assert_eq!(status.gpu.available, status.gpu.max);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gpu_wait_timeout_fails_the_loser() {
    let pipeline = Arc::new(|_: &facefusion_protocol::JobConfig, _: &facefusion_orchestrator::JobContext| {
        std::thread::sleep(Duration::from_millis(500));
        true
    });
    let limits = ResourceLimits {
        max_gpu_jobs: 1,
        max_cpu_workers: 2,
        gpu_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let env = start(pipeline, limits).await;

    let first = env
        .orchestrator
        .submit(request(&env.workspace))
        .await
        .unwrap();
    let second = env
        .orchestrator
        .submit(request(&env.workspace))
        .await
        .unwrap();
    env.orchestrator.run_job(&first).await.unwrap();
    env.orchestrator.run_job(&second).await.unwrap();

    let first = wait_terminal(&env.orchestrator, &first).await;
    let second = wait_terminal(&env.orchestrator, &second).await;

    let mut statuses = [
        (first.status, first.error_code),
        (second.status, second.error_code),
    ];
    statuses.sort_by_key(|(status, _)| *status == JobStatus::Failed);
    assert_eq!(statuses[0], (JobStatus::Completed, None));
    assert_eq!(statuses[1], (JobStatus::Failed, Some(ErrorCode::CudaError)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn queued_jobs_run_in_priority_then_age_order() {
    let order = Arc::new(Mutex::new(Vec::<String>::new()));
    let order_in_pipeline = Arc::clone(&order);
    let pipeline = Arc::new(move |_: &facefusion_protocol::JobConfig, ctx: &facefusion_orchestrator::JobContext| {
        order_in_pipeline
            .lock()
            .unwrap()
            .push(ctx.job_id().to_string());
        true
    });
    let limits = ResourceLimits {
        max_cpu_workers: 1,
        ..Default::default()
    };
    let env = start(pipeline, limits).await;

    let low = env
        .orchestrator
        .submit(request(&env.workspace))
        .await
        .unwrap();
    let high = env
        .orchestrator
        .submit(request(&env.workspace))
        .await
        .unwrap();
    let medium = env
        .orchestrator
        .submit(request(&env.workspace))
        .await
        .unwrap();
    env.orchestrator.set_priority(&high, 10).await.unwrap();
    env.orchestrator.set_priority(&medium, 5).await.unwrap();

    assert_eq!(env.orchestrator.run_all_queued().await.unwrap(), 3);
    for job_id in [&low, &high, &medium] {
        wait_terminal(&env.orchestrator, job_id).await;
    }

    let observed = order.lock().unwrap().clone();
    assert_eq!(observed, vec![high, medium, low]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_reconciles_orphaned_running_rows() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("orchestrator.db");

    {
        let store = JobStore::open(&db_path).await.unwrap();
        let mut job = Job::new("job-orphan");
        job.transition_to(JobStatus::Queued);
        job.transition_to(JobStatus::Running);
        store.create_job(&job).await.unwrap();
        store.close().await;
    }

    let pipeline = Arc::new(|_: &facefusion_protocol::JobConfig, _: &facefusion_orchestrator::JobContext| true);
    let store = JobStore::open(&db_path).await.unwrap();
    let roots = AllowedRoots::new([dir.path()]);
    let orchestrator = Orchestrator::new(
        store,
        EventBus::new(),
        ResourceManager::new(ResourceLimits::default()),
        roots,
        pipeline,
    )
    .await
    .unwrap();

    let job = orchestrator.get_job("job-orphan").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_code, Some(ErrorCode::InternalError));
    assert_eq!(job.error_message.as_deref(), Some("orphaned"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_refuses_new_work() {
    let pipeline = Arc::new(|_: &facefusion_protocol::JobConfig, _: &facefusion_orchestrator::JobContext| true);
    let env = start(pipeline, ResourceLimits::default()).await;

    let job_id = env
        .orchestrator
        .submit(request(&env.workspace))
        .await
        .unwrap();
    env.orchestrator.shutdown().await;

    assert!(!env.orchestrator.run_job(&job_id).await.unwrap());
    assert!(env
        .orchestrator
        .submit(request(&env.workspace))
        .await
        .is_err());

    // The queued row is untouched.
    let store = JobStore::open(&env._dir.path().join("orchestrator.db"))
        .await
        .unwrap();
    let job = store.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_is_idempotent_and_noop_on_terminal() {
    let pipeline = Arc::new(|_: &facefusion_protocol::JobConfig, _: &facefusion_orchestrator::JobContext| true);
    let env = start(pipeline, ResourceLimits::default()).await;

    let job_id = env
        .orchestrator
        .submit(request(&env.workspace))
        .await
        .unwrap();

    assert!(env.orchestrator.cancel_job(&job_id).await.unwrap());
    let after_first = env.orchestrator.get_job(&job_id).await.unwrap().unwrap();
    assert!(env.orchestrator.cancel_job(&job_id).await.unwrap());
    let after_second = env.orchestrator.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(after_first.status, after_second.status);
    assert_eq!(after_first.cancel_requested, after_second.cancel_requested);
    assert_eq!(after_first.progress, after_second.progress);

    env.orchestrator.run_job(&job_id).await.unwrap();
    let job = wait_terminal(&env.orchestrator, &job_id).await;
    assert_eq!(job.status, JobStatus::Canceled);

    // Terminal cancel reports success and changes nothing.
    assert!(env.orchestrator.cancel_job(&job_id).await.unwrap());
    let after = env.orchestrator.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(after.status, JobStatus::Canceled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unqueue_and_delete_lifecycle() {
    let pipeline = Arc::new(|_: &facefusion_protocol::JobConfig, _: &facefusion_orchestrator::JobContext| true);
    let env = start(pipeline, ResourceLimits::default()).await;

    let job_id = env
        .orchestrator
        .submit(request(&env.workspace))
        .await
        .unwrap();

    // Unqueue reverts to drafted; a drafted job cannot be unqueued again.
    assert!(env.orchestrator.unqueue_job(&job_id).await.unwrap());
    let job = env.orchestrator.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Drafted);
    assert!(!env.orchestrator.unqueue_job(&job_id).await.unwrap());

    // Deleting a live job is refused.
    assert!(!env.orchestrator.delete_job(&job_id).await.unwrap());

    // Re-queue, run to completion, then delete.
    assert!(env.orchestrator.queue_job(&job_id).await.unwrap());
    env.orchestrator.run_job(&job_id).await.unwrap();
    wait_terminal(&env.orchestrator, &job_id).await;
    assert!(env.orchestrator.delete_job(&job_id).await.unwrap());
    assert!(env.orchestrator.get_job(&job_id).await.unwrap().is_none());

    let counts = env.orchestrator.status_counts().await.unwrap();
    assert_eq!(counts.completed, 0);
    assert_eq!(counts.queued, 0);
}
