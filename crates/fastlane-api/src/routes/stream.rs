//! Live log streaming: SSE and WebSocket tails over the runtime
//!
//! The stream polls the container's logs and pushes deltas; the canonical
//! logs remain the last-N-bytes capture the monitor persists at the
//! terminal transition, which may trail what a stream client observed.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use tracing::debug;

use fastlane_core::runtime::ContainerRuntime;
use fastlane_core::JobId;

use crate::error::ApiError;
use crate::routes::jobs::parse_job_id;
use crate::state::AppState;

const POLL_PERIOD: Duration = Duration::from_secs(1);

enum TailStep {
    /// New output since the last poll
    Chunk(String),

    /// Nothing new yet
    Idle,

    /// The execution is terminal; the tail is complete
    Finished,
}

/// Cursor over a job's live output
struct LogTail {
    state: AppState,
    task_id: String,
    job_id: JobId,
    sent: usize,
}

impl LogTail {
    fn new(state: AppState, task_id: String, job_id: JobId) -> Self {
        Self { state, task_id, job_id, sent: 0 }
    }

    async fn step(&mut self) -> TailStep {
        let job = match self.state.service.get_job(&self.task_id, self.job_id).await {
            Ok(job) => job,
            Err(_) => return TailStep::Finished,
        };

        let execution = match job.latest_execution() {
            Some(execution) => execution.clone(),
            None if job.status.is_terminal() => return TailStep::Finished,
            None => return TailStep::Idle,
        };

        // terminal: flush whatever the store captured and end the stream
        if execution.is_terminal() && execution.finished_at.is_some() {
            let combined = combine(&execution.stdout, &execution.stderr);
            let delta = delta_from(&combined, self.sent);
            self.sent = combined.len();
            return if delta.is_empty() { TailStep::Finished } else { TailStep::Chunk(delta) };
        }

        let (container_id, host) = match (&execution.container_id, &execution.container_host) {
            (Some(container_id), Some(host)) => (container_id.clone(), host.clone()),
            _ => return TailStep::Idle,
        };
        let runtime = match self.state.ctx.runtime(&host) {
            Ok(runtime) => runtime,
            Err(_) => return TailStep::Finished,
        };

        let tail_bytes = self.state.ctx.config.monitor.logs_tail_bytes;
        match runtime.logs(&container_id, tail_bytes).await {
            Ok(logs) => {
                let combined = combine(
                    &String::from_utf8_lossy(&logs.stdout),
                    &String::from_utf8_lossy(&logs.stderr),
                );
                let delta = delta_from(&combined, self.sent);
                if delta.is_empty() {
                    TailStep::Idle
                } else {
                    self.sent = combined.len();
                    TailStep::Chunk(delta)
                }
            }
            Err(e) => {
                debug!(container_id = %container_id, "stream log fetch failed: {}", e);
                TailStep::Idle
            }
        }
    }

    /// Block until the next chunk, or None when the tail completed
    async fn next_chunk(&mut self) -> Option<String> {
        loop {
            match self.step().await {
                TailStep::Chunk(chunk) => return Some(chunk),
                TailStep::Finished => return None,
                TailStep::Idle => tokio::time::sleep(POLL_PERIOD).await,
            }
        }
    }
}

fn combine(stdout: &str, stderr: &str) -> String {
    if stderr.is_empty() {
        stdout.to_string()
    } else {
        format!("{}{}", stdout, stderr)
    }
}

fn delta_from(combined: &str, sent: usize) -> String {
    if combined.len() > sent {
        combined[sent..].to_string()
    } else {
        String::new()
    }
}

fn sse_events(tail: LogTail) -> impl Stream<Item = Result<Event, Infallible>> {
    futures::stream::unfold(tail, |mut tail| async move {
        tail.next_chunk()
            .await
            .map(|chunk| (Ok(Event::default().data(chunk)), tail))
    })
}

/// `GET /tasks/{t}/jobs/{j}/stream`: server-sent log tail
pub async fn sse_stream(
    State(state): State<AppState>,
    Path((task_id, job_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    // 404 before the stream starts
    state.service.get_job(&task_id, job_id).await?;

    let tail = LogTail::new(state, task_id, job_id);
    Ok(Sse::new(sse_events(tail)).keep_alive(KeepAlive::default()).into_response())
}

/// `GET /tasks/{t}/jobs/{j}/ws`: WebSocket log tail
pub async fn ws_stream(
    State(state): State<AppState>,
    Path((task_id, job_id)): Path<(String, String)>,
    upgrade: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    state.service.get_job(&task_id, job_id).await?;

    Ok(upgrade.on_upgrade(move |socket| pump_ws(socket, state, task_id, job_id)))
}

async fn pump_ws(mut socket: WebSocket, state: AppState, task_id: String, job_id: JobId) {
    let mut tail = LogTail::new(state, task_id, job_id);
    while let Some(chunk) = tail.next_chunk().await {
        if socket.send(Message::Text(chunk)).await.is_err() {
            return;
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}
