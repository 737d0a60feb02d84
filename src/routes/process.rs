//! Background-process endpoints.
//!
//! - `POST /api/process/start` — start a command in the background
//! - `GET /api/process/list` — list records (`?session=`, `?status=`)
//! - `GET /api/process/{id}` — one record
//! - `DELETE /api/process/{id}` — kill a tracked command
//! - `DELETE /api/process/kill-all` — kill every tracked command
//! - `GET /api/process/{id}/logs` — accumulated stdout/stderr
//! - `GET /api/process/{id}/stream` — SSE: `process_info`, `stdout`,
//!   `stderr`, `exit`

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::SandboxError;
use crate::process::{ProcessEvent, ProcessFilter, ProcessPatch, ProcessStatus};
use crate::routes::execute::{start_background, ExecuteRequest};
use crate::sessions::command::signal_from_name;
use crate::AppState;

/// Request body for `POST /api/process/start`.
#[derive(Debug, Deserialize)]
pub struct StartProcessRequest {
    pub command: String,
    #[serde(default)]
    pub options: StartProcessOptions,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartProcessOptions {
    pub session_id: Option<String>,
    pub cwd: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// `POST /api/process/start`.
pub async fn start(
    State(state): State<AppState>,
    Json(payload): Json<StartProcessRequest>,
) -> Result<Json<Value>, SandboxError> {
    if payload.command.is_empty() {
        return Err(SandboxError::validation("command is required"));
    }
    let session = payload
        .options
        .session_id
        .clone()
        .unwrap_or_else(|| state.config.session.default_session_id.clone());
    let request = ExecuteRequest {
        command: payload.command,
        session_id: Some(session.clone()),
        background: true,
        cwd: payload.options.cwd,
        timeout_ms: payload.options.timeout_ms,
    };
    let record = start_background(&state, &session, &request).await?;
    Ok(Json(json!({
        "process": {
            "id": record.id,
            "command": record.command,
            "status": record.status,
            "startTime": record.start_time,
            "sessionId": record.session_id,
        }
    })))
}

/// Query parameters for `GET /api/process/list`.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub session: Option<String>,
    pub status: Option<String>,
}

/// `GET /api/process/list`.
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, SandboxError> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(
            serde_json::from_value::<ProcessStatus>(Value::String(raw.to_string()))
                .map_err(|_| SandboxError::validation(format!("unknown status: {raw}")))?,
        ),
    };
    let records = state
        .processes
        .list(&ProcessFilter {
            status,
            session_id: query.session,
        })
        .await;
    Ok(Json(json!({ "count": records.len(), "processes": records })))
}

/// `GET /api/process/{id}`.
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, SandboxError> {
    let record = state
        .processes
        .get(&id)
        .await
        .ok_or_else(|| SandboxError::not_found(format!("process {id} not found")))?;
    Ok(Json(json!({ "process": record })))
}

/// Optional body for `DELETE /api/process/{id}`.
#[derive(Debug, Default, Deserialize)]
pub struct KillRequest {
    pub signal: Option<String>,
}

/// `DELETE /api/process/{id}` — kill a tracked command.
///
/// A command that already completed (or never existed) reports
/// `COMMAND_NOT_FOUND`.
pub async fn kill(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Option<Json<KillRequest>>,
) -> Response {
    let signal = signal_from_name(
        payload
            .as_ref()
            .and_then(|p| p.signal.as_deref()),
    );

    let Some(session) = state.sessions.registry.session_for(&id).await else {
        return SandboxError::command_not_found(&id).into_response();
    };
    if let Err(e) = state.sessions.kill_command(&session, &id, signal).await {
        return e.with_code("COMMAND_NOT_FOUND").into_response();
    }

    // Mark the record terminal before the stream consumer races us; the
    // store ignores whichever update arrives second.
    state
        .processes
        .update(
            &id,
            ProcessPatch {
                status: Some(ProcessStatus::Killed),
                exit_code: Some(128 + signal),
                ..ProcessPatch::default()
            },
        )
        .await;

    Json(json!({ "success": true, "processId": id })).into_response()
}

/// `DELETE /api/process/kill-all`.
pub async fn kill_all(State(state): State<AppState>) -> Json<Value> {
    let handles = state.sessions.kill_all_commands(libc::SIGTERM).await;
    let killed_count = handles.len();
    for handle in handles {
        state
            .processes
            .update(
                &handle.command_id,
                ProcessPatch {
                    status: Some(ProcessStatus::Killed),
                    exit_code: Some(128 + libc::SIGTERM),
                    ..ProcessPatch::default()
                },
            )
            .await;
    }
    Json(json!({ "killedCount": killed_count }))
}

/// `GET /api/process/{id}/logs`.
pub async fn logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, SandboxError> {
    let record = state
        .processes
        .get(&id)
        .await
        .ok_or_else(|| SandboxError::not_found(format!("process {id} not found")))?;
    Ok(Json(json!({ "stdout": record.stdout, "stderr": record.stderr })))
}

/// `GET /api/process/{id}/stream` — SSE over a live record's output.
///
/// Emits `process_info` first (with the output so far), then `stdout` /
/// `stderr` deltas, then `exit`. For an already-terminal record the stream
/// is just `process_info` + `exit`.
pub async fn stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, SandboxError> {
    let record = state
        .processes
        .get(&id)
        .await
        .ok_or_else(|| SandboxError::not_found(format!("process {id} not found")))?;
    let subscription = state.processes.subscribe(&id).await;

    let mut initial = vec![Event::default()
        .event("process_info")
        .data(json!({ "process": record }).to_string())];
    if subscription.is_none() {
        initial.push(
            Event::default()
                .event("exit")
                .data(json!({ "exitCode": record.exit_code }).to_string()),
        );
    }

    let live = futures::stream::unfold(subscription, |state| async move {
        let mut rx = state?;
        loop {
            match rx.recv().await {
                Ok(ProcessEvent::Stdout(data)) => {
                    let ev = Event::default()
                        .event("stdout")
                        .data(json!({ "data": data }).to_string());
                    return Some((ev, Some(rx)));
                }
                Ok(ProcessEvent::Stderr(data)) => {
                    let ev = Event::default()
                        .event("stderr")
                        .data(json!({ "data": data }).to_string());
                    return Some((ev, Some(rx)));
                }
                Ok(ProcessEvent::Exit { exit_code }) => {
                    let ev = Event::default()
                        .event("exit")
                        .data(json!({ "exitCode": exit_code }).to_string());
                    return Some((ev, None));
                }
                // Status transitions are implicit in the other events.
                Ok(ProcessEvent::Status(_)) => {}
                // Channel closed or lagged: end the stream.
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
            }
        }
    });

    let stream = futures::stream::iter(initial)
        .chain(live)
        .map(Ok::<_, std::convert::Infallible>);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default().interval(std::time::Duration::from_secs(15))))
}
