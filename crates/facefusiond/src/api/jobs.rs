//! REST handlers for job submission, control and listing.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::info;

use facefusion_db::StatusCounts;
use facefusion_orchestrator::ResourceStatus;
use facefusion_protocol::{Job, JobStatus, RunRequest};
use facefusion_security::validate_input_path;

use super::{api_error, ApiError, AppState};

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// ============================================================================
// Submission
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RunBody {
    #[serde(default)]
    pub source_paths: Vec<String>,
    #[serde(default)]
    pub target_path: Option<String>,
    #[serde(default)]
    pub output_path: Option<String>,
    #[serde(default)]
    pub processors: Vec<String>,
    #[serde(default)]
    pub settings: Map<String, Value>,
    #[serde(default)]
    pub job_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub status: &'static str,
    pub job_id: String,
    pub output_path: String,
}

/// Submit and start one job. `202` on success; `400` when the target is
/// missing or rejected; `500` when submission fails.
pub async fn run(
    State(state): State<AppState>,
    Json(body): Json<RunBody>,
) -> Result<(StatusCode, Json<RunResponse>), ApiError> {
    let target_path = body
        .target_path
        .filter(|target| !target.trim().is_empty())
        .ok_or_else(|| {
            api_error(
                StatusCode::BAD_REQUEST,
                "No target media selected. Please re-select the file.",
            )
        })?;

    validate_input_path(&target_path, &state.roots)
        .map_err(|err| api_error(StatusCode::BAD_REQUEST, err.to_string()))?;

    let output_path = match body.output_path.filter(|output| !output.trim().is_empty()) {
        Some(output) => output,
        None => default_output_path(&target_path)
            .map_err(|err| api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?,
    };

    let request = RunRequest {
        source_paths: body.source_paths,
        target_path,
        output_path: output_path.clone(),
        processors: body.processors,
        settings: body.settings,
        job_id: body.job_id,
    };

    let job_id = state.orchestrator.submit(request).await.map_err(|err| {
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Job submission failed: {err}"),
        )
    })?;
    info!("submitted job {}", job_id);

    let started = state.orchestrator.run_job(&job_id).await.map_err(|err| {
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to start job {job_id}: {err}"),
        )
    })?;
    if !started {
        return Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to start job {job_id}"),
        ));
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(RunResponse {
            status: "queued",
            job_id,
            output_path,
        }),
    ))
}

/// Auto-filled output location under tmp, keeping the target's extension.
fn default_output_path(target_path: &str) -> std::io::Result<String> {
    let extension = PathBuf::from(target_path)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_else(|| ".mp4".to_string());
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);

    let dir = std::env::temp_dir().join("api_outputs");
    std::fs::create_dir_all(&dir)?;
    Ok(dir
        .join(format!("output_{stamp}{extension}"))
        .display()
        .to_string())
}

// ============================================================================
// Control
// ============================================================================

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub status: &'static str,
    pub count: u32,
}

/// Cancel every running and queued job.
pub async fn stop(State(state): State<AppState>) -> Result<Json<StopResponse>, ApiError> {
    let count = state
        .orchestrator
        .cancel_active()
        .await
        .map_err(internal)?;
    info!("stop requested, {} job(s) flagged", count);
    Ok(Json(StopResponse {
        status: "stopping",
        count,
    }))
}

pub async fn job_snapshot(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    fetch_job(&state, &job_id).await.map(Json)
}

pub async fn job_detail(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    fetch_job(&state, &job_id).await.map(Json)
}

async fn fetch_job(state: &AppState, job_id: &str) -> Result<Job, ApiError> {
    state
        .orchestrator
        .get_job(job_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Job not found: {job_id}")))
}

// ============================================================================
// Listing
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<u32>,
}

/// Compact listing entry for the job manager UI.
#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: f32,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub priority: i64,
    pub target_path: Option<String>,
    pub output_path: Option<String>,
    pub error_code: Option<String>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        let config_str = |key: &str| {
            job.config
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        Self {
            job_id: job.job_id.clone(),
            status: job.status,
            progress: job.progress,
            created_at: job.created_at.to_rfc3339(),
            started_at: job.started_at.map(|t| t.to_rfc3339()),
            completed_at: job.completed_at.map(|t| t.to_rfc3339()),
            priority: job.priority(),
            target_path: config_str("target_path"),
            output_path: config_str("output_path"),
            error_code: job.error_code.map(|code| code.as_str().to_string()),
        }
    }
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<JobSummary>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(|err| api_error(StatusCode::BAD_REQUEST, err.to_string()))?;
    let limit = query.limit.unwrap_or(100);

    let jobs = state
        .orchestrator
        .list_jobs(status, limit)
        .await
        .map_err(internal)?;
    Ok(Json(jobs.iter().map(JobSummary::from).collect()))
}

// ============================================================================
// Bulk operations
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct JobIdsBody {
    pub job_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct PriorityBody {
    pub job_ids: Vec<String>,
    pub priority: i64,
}

pub async fn bulk_submit(
    State(state): State<AppState>,
    Json(body): Json<JobIdsBody>,
) -> Result<Json<Value>, ApiError> {
    let mut queued = 0;
    for job_id in &body.job_ids {
        if state.orchestrator.queue_job(job_id).await.map_err(internal)? {
            queued += 1;
        }
    }
    Ok(Json(json!({ "queued": queued })))
}

pub async fn bulk_unqueue(
    State(state): State<AppState>,
    Json(body): Json<JobIdsBody>,
) -> Result<Json<Value>, ApiError> {
    let mut unqueued = 0;
    for job_id in &body.job_ids {
        if state
            .orchestrator
            .unqueue_job(job_id)
            .await
            .map_err(internal)?
        {
            unqueued += 1;
        }
    }
    Ok(Json(json!({ "unqueued": unqueued })))
}

pub async fn bulk_delete(
    State(state): State<AppState>,
    Json(body): Json<JobIdsBody>,
) -> Result<Json<Value>, ApiError> {
    let mut deleted = 0;
    for job_id in &body.job_ids {
        if state
            .orchestrator
            .delete_job(job_id)
            .await
            .map_err(internal)?
        {
            deleted += 1;
        }
    }
    Ok(Json(json!({ "deleted": deleted })))
}

pub async fn set_priority(
    State(state): State<AppState>,
    Json(body): Json<PriorityBody>,
) -> Result<Json<Value>, ApiError> {
    let mut updated = 0;
    for job_id in &body.job_ids {
        if state
            .orchestrator
            .set_priority(job_id, body.priority)
            .await
            .map_err(internal)?
        {
            updated += 1;
        }
    }
    Ok(Json(json!({ "updated": updated })))
}

pub async fn run_all(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let started = state
        .orchestrator
        .run_all_queued()
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "started": started })))
}

// ============================================================================
// Aggregate status
// ============================================================================

#[derive(Debug, Serialize)]
pub struct AggregateStatus {
    pub jobs: StatusCounts,
    pub resources: ResourceStatus,
}

pub async fn aggregate_status(
    State(state): State<AppState>,
) -> Result<Json<AggregateStatus>, ApiError> {
    let jobs = state.orchestrator.status_counts().await.map_err(internal)?;
    Ok(Json(AggregateStatus {
        jobs,
        resources: state.orchestrator.resources().status(),
    }))
}

fn internal(err: impl std::fmt::Display) -> ApiError {
    api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}
