//! HTTP surface: REST job control, SSE job events and the log WebSocket.
//!
//! Everything except `/logs` sits behind the loopback guard; the WebSocket
//! applies the policy itself so remote clients get a proper close frame.

pub mod events;
pub mod jobs;
pub mod logs;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{AllowOrigin, CorsLayer};

use facefusion_logging::LogBroadcaster;
use facefusion_orchestrator::Orchestrator;
use facefusion_security::AllowedRoots;

use crate::config::ServerConfig;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub broadcaster: LogBroadcaster,
    pub roots: AllowedRoots,
    pub config: Arc<ServerConfig>,
}

/// Error body mirrored from the original server: `{"detail": "..."}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub detail: String,
}

pub type ApiError = (StatusCode, Json<ErrorBody>);

pub fn api_error(status: StatusCode, detail: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            detail: detail.into(),
        }),
    )
}

pub fn router(state: AppState) -> Router {
    let guarded = Router::new()
        .route("/health", get(jobs::health))
        .route("/run", post(jobs::run))
        .route("/stop", post(jobs::stop))
        .route("/jobs/{job_id}", get(jobs::job_snapshot))
        .route("/jobs/{job_id}/events", get(events::job_events))
        .route(
            "/api/v1/jobs",
            get(jobs::list_jobs).delete(jobs::bulk_delete),
        )
        .route("/api/v1/jobs/submit", post(jobs::bulk_submit))
        .route("/api/v1/jobs/unqueue", post(jobs::bulk_unqueue))
        .route("/api/v1/jobs/priority", post(jobs::set_priority))
        .route("/api/v1/jobs/run", post(jobs::run_all))
        .route("/api/v1/jobs/status", get(jobs::aggregate_status))
        .route("/api/v1/jobs/{job_id}", get(jobs::job_detail))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_local,
        ));

    Router::new()
        .merge(guarded)
        .route("/logs", get(logs::stream))
        .layer(cors_layer(&state.config))
        .with_state(state)
}

/// Reject non-loopback clients unless remote access is enabled.
async fn require_local(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if state.config.allow_remote || addr.ip().is_loopback() {
        next.run(request).await
    } else {
        api_error(StatusCode::FORBIDDEN, "Remote access disabled").into_response()
    }
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origins()
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true)
}
