//! Server-sent job event streams.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use futures::stream::{self, BoxStream, StreamExt};

use facefusion_protocol::JobEvent;

use super::{api_error, ApiError, AppState};

type EventResult = Result<Event, Infallible>;

/// Stream events for one job as `data: <json JobEvent>` messages. The stream
/// closes after the job's terminal event; a job that is already terminal
/// yields its final status once and closes immediately.
pub async fn job_events(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Sse<KeepAliveStream<BoxStream<'static, EventResult>>>, ApiError> {
    let job = state
        .orchestrator
        .get_job(&job_id)
        .await
        .map_err(|err| api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Job not found: {job_id}")))?;

    let stream: BoxStream<'static, EventResult> = if job.status.is_terminal() {
        let message = job.error_message.clone().unwrap_or_default();
        let event = JobEvent::status(&job_id, job.status, &message);
        stream::once(async move { Ok(sse_event(&event)) }).boxed()
    } else {
        let subscription = state.orchestrator.bus().subscribe_job(&job_id);
        stream::unfold(subscription, |mut subscription| async move {
            subscription
                .next()
                .await
                .map(|event| (Ok(sse_event(&event)), subscription))
        })
        .boxed()
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn sse_event(event: &JobEvent) -> Event {
    Event::default().data(serde_json::to_string(event).unwrap_or_default())
}
