//! Command execution endpoints.
//!
//! - `POST /api/execute` — run a command in a session and return its output
//!   (or, with `background: true`, start it and return a process record).
//! - `POST /api/execute/stream` — run a command and stream `start`,
//!   `stdout`, `stderr`, `complete`, and `error` SSE events.

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::SandboxError;
use crate::process::{ProcessPatch, ProcessRecord, ProcessStatus, ProcessStore};
use crate::sessions::shell::StreamEvent;
use crate::util::now_ms;
use crate::AppState;

/// Request body shared by `/api/execute` and `/api/execute/stream`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub command: String,
    pub session_id: Option<String>,
    #[serde(default)]
    pub background: bool,
    pub cwd: Option<String>,
    pub timeout_ms: Option<u64>,
}

fn session_id(state: &AppState, requested: Option<&str>) -> String {
    requested
        .map(ToString::to_string)
        .unwrap_or_else(|| state.config.session.default_session_id.clone())
}

/// `POST /api/execute`.
pub async fn execute(
    State(state): State<AppState>,
    Json(payload): Json<ExecuteRequest>,
) -> Result<Json<Value>, SandboxError> {
    if payload.command.is_empty() {
        return Err(SandboxError::validation("command is required"));
    }
    let session = session_id(&state, payload.session_id.as_deref());

    if payload.background {
        let record = start_background(&state, &session, &payload).await?;
        return Ok(Json(json!({
            "success": true,
            "processId": record.id,
            "command": record.command,
            "sessionId": record.session_id,
            "status": record.status,
            "startTime": record.start_time,
            "timestamp": now_ms(),
        })));
    }

    let outcome = state
        .sessions
        .exec(
            &session,
            &payload.command,
            payload.cwd.as_deref(),
            payload.timeout_ms,
        )
        .await?;
    Ok(Json(json!({
        "success": outcome.exit_code == 0,
        "exitCode": outcome.exit_code,
        "stdout": outcome.stdout,
        "stderr": outcome.stderr,
        "command": payload.command,
        "timestamp": now_ms(),
    })))
}

/// Start a command in the background: create its process record, begin the
/// stream (which registers the command for kill), and attach a detached
/// consumer that mirrors events into the record store.
pub async fn start_background(
    state: &AppState,
    session: &str,
    payload: &ExecuteRequest,
) -> Result<ProcessRecord, SandboxError> {
    let command_id = uuid::Uuid::new_v4().to_string();
    let record = ProcessRecord::new(&command_id, session, &payload.command, payload.cwd.clone());
    state.processes.create(record.clone()).await;

    let events = match state
        .sessions
        .exec_stream(
            session,
            &payload.command,
            payload.cwd.as_deref(),
            &command_id,
            true,
            payload.timeout_ms,
        )
        .await
    {
        Ok(rx) => rx,
        Err(e) => {
            state
                .processes
                .update(
                    &command_id,
                    ProcessPatch {
                        status: Some(ProcessStatus::Error),
                        ..ProcessPatch::default()
                    },
                )
                .await;
            return Err(e);
        }
    };

    let store = state.processes.clone();
    tokio::spawn(consume_into_store(events, store, command_id));
    Ok(record)
}

/// Mirror a command's stream events into its process record; the terminal
/// event persists the record and evicts it from memory.
async fn consume_into_store(
    mut events: mpsc::Receiver<StreamEvent>,
    store: ProcessStore,
    process_id: String,
) {
    while let Some(event) = events.recv().await {
        let patch = match event {
            StreamEvent::Start { .. } => ProcessPatch {
                status: Some(ProcessStatus::Running),
                ..ProcessPatch::default()
            },
            StreamEvent::Stdout { data } => ProcessPatch {
                append_stdout: Some(data),
                ..ProcessPatch::default()
            },
            StreamEvent::Stderr { data } => ProcessPatch {
                append_stderr: Some(data),
                ..ProcessPatch::default()
            },
            StreamEvent::Complete { exit_code } => {
                store
                    .update(
                        &process_id,
                        ProcessPatch {
                            status: Some(ProcessStatus::from_exit_code(exit_code)),
                            exit_code: Some(exit_code),
                            ..ProcessPatch::default()
                        },
                    )
                    .await;
                break;
            }
            StreamEvent::Error { error } => {
                store
                    .update(
                        &process_id,
                        ProcessPatch {
                            status: Some(ProcessStatus::Error),
                            append_stderr: Some(error.to_string()),
                            ..ProcessPatch::default()
                        },
                    )
                    .await;
                break;
            }
        };
        store.update(&process_id, patch).await;
    }
}

/// Convert one shell stream event into an SSE frame.
pub fn stream_event_to_sse(event: &StreamEvent) -> Event {
    match event {
        StreamEvent::Start {
            command_id,
            command,
            timestamp_ms,
        } => Event::default().event("start").data(
            json!({
                "commandId": command_id,
                "command": command,
                "timestamp": timestamp_ms,
            })
            .to_string(),
        ),
        StreamEvent::Stdout { data } => Event::default()
            .event("stdout")
            .data(json!({ "data": data }).to_string()),
        StreamEvent::Stderr { data } => Event::default()
            .event("stderr")
            .data(json!({ "data": data }).to_string()),
        StreamEvent::Complete { exit_code } => Event::default()
            .event("complete")
            .data(json!({ "exitCode": exit_code }).to_string()),
        StreamEvent::Error { error } => Event::default()
            .event("error")
            .data(error.to_json()["error"].to_string()),
    }
}

/// `POST /api/execute/stream` — SSE command execution.
pub async fn execute_stream(
    State(state): State<AppState>,
    Json(payload): Json<ExecuteRequest>,
) -> Result<impl IntoResponse, SandboxError> {
    if payload.command.is_empty() {
        return Err(SandboxError::validation("command is required"));
    }
    let session = session_id(&state, payload.session_id.as_deref());
    let command_id = uuid::Uuid::new_v4().to_string();

    // The command is tracked and its first event queued before this returns,
    // so an immediate kill via /api/process/{id} cannot miss it.
    let events = state
        .sessions
        .exec_stream(
            &session,
            &payload.command,
            payload.cwd.as_deref(),
            &command_id,
            payload.background,
            payload.timeout_ms,
        )
        .await?;

    let stream = futures::stream::unfold(Some(events), |state| async move {
        let mut rx = state?;
        match rx.recv().await {
            Some(event) => {
                let terminal = matches!(
                    event,
                    StreamEvent::Complete { .. } | StreamEvent::Error { .. }
                );
                let sse = stream_event_to_sse(&event);
                let next = if terminal { None } else { Some(rx) };
                Some((Ok::<_, std::convert::Infallible>(sse), next))
            }
            None => None,
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default().interval(std::time::Duration::from_secs(15))))
}
