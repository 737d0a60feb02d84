//! PTY endpoints.
//!
//! - `POST /api/pty` — create a terminal
//! - `GET /api/pty` / `GET /api/pty/{id}` — list / inspect
//! - `DELETE /api/pty/{id}` — signal and remove
//! - `POST /api/pty/{id}/input` — write (base64) bytes
//! - `POST /api/pty/{id}/resize` — change the window size
//! - `GET /api/pty/{id}/stream` — SSE output (replay first, then live)
//!
//! Output bytes travel base64-encoded inside JSON frames — terminal output
//! is not valid UTF-8 in general.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::SandboxError;
use crate::pty::PtyManager;
use crate::AppState;

/// Request body for `POST /api/pty`.
#[derive(Debug, Default, Deserialize)]
pub struct CreatePtyRequest {
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub command: Option<Vec<String>>,
    pub cwd: Option<String>,
    pub env: Option<HashMap<String, String>>,
}

/// `POST /api/pty`.
pub async fn create(
    State(state): State<AppState>,
    payload: Option<Json<CreatePtyRequest>>,
) -> Result<Json<Value>, SandboxError> {
    let payload = payload.map(|Json(p)| p).unwrap_or_default();
    let info = state
        .ptys
        .create(
            payload.cols,
            payload.rows,
            payload.command,
            payload.cwd.as_deref(),
            payload.env,
        )
        .await?;
    Ok(Json(json!({ "pty": info })))
}

/// `GET /api/pty`.
pub async fn list(State(state): State<AppState>) -> Json<Value> {
    let ptys = state.ptys.list().await;
    Json(json!({ "count": ptys.len(), "ptys": ptys }))
}

/// `GET /api/pty/{id}`.
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, SandboxError> {
    let pty = state.ptys.get(&id).await?;
    Ok(Json(json!({ "pty": pty.info().await })))
}

/// Query for `DELETE /api/pty/{id}`.
#[derive(Debug, Deserialize)]
pub struct KillQuery {
    pub signal: Option<String>,
}

/// `DELETE /api/pty/{id}`.
pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<KillQuery>,
) -> Result<Json<Value>, SandboxError> {
    state.ptys.remove(&id, query.signal.as_deref()).await?;
    Ok(Json(json!({ "success": true, "id": id })))
}

/// Request body for `POST /api/pty/{id}/input`.
#[derive(Debug, Deserialize)]
pub struct InputRequest {
    /// Base64-encoded bytes to write to the terminal.
    pub data: String,
}

/// `POST /api/pty/{id}/input`.
pub async fn input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<InputRequest>,
) -> Result<Json<Value>, SandboxError> {
    let bytes = BASE64
        .decode(payload.data.as_bytes())
        .map_err(|e| SandboxError::validation(format!("data is not valid base64: {e}")))?;
    let pty = state.ptys.get(&id).await?;
    pty.write(bytes).await?;
    Ok(Json(json!({ "success": true })))
}

/// Request body for `POST /api/pty/{id}/resize`.
#[derive(Debug, Deserialize)]
pub struct ResizeRequest {
    pub cols: u16,
    pub rows: u16,
}

/// `POST /api/pty/{id}/resize`.
pub async fn resize(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<ResizeRequest>,
) -> Result<Json<Value>, SandboxError> {
    if payload.cols == 0 || payload.rows == 0 {
        return Err(SandboxError::validation("cols and rows must be non-zero"));
    }
    let pty = state.ptys.get(&id).await?;
    pty.resize(payload.cols, payload.rows).await?;
    Ok(Json(json!({ "success": true, "cols": payload.cols, "rows": payload.rows })))
}

/// Arms the disconnect timer when the last subscriber goes away.
struct DisconnectGuard {
    manager: PtyManager,
    pty: std::sync::Arc<crate::pty::Pty>,
    sub_id: u64,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let manager = self.manager.clone();
        let pty = std::sync::Arc::clone(&self.pty);
        let sub_id = self.sub_id;
        tokio::spawn(async move {
            pty.unsubscribe(sub_id).await;
            if pty.subscriber_count().await == 0 && !pty.is_exited().await {
                debug!("pty {}: last subscriber detached, arming disconnect timer", pty.id);
                manager.start_disconnect_timer(&pty.id).await;
            }
        });
    }
}

/// `GET /api/pty/{id}/stream` — replay buffer first, then live output; a
/// final `exit` event carries the exit code.
pub async fn stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, SandboxError> {
    let pty = state.ptys.get(&id).await?;
    state.ptys.cancel_disconnect_timer(&id).await;

    let (replay, rx, sub_id) = pty.subscribe().await;
    let guard = DisconnectGuard {
        manager: state.ptys.clone(),
        pty: std::sync::Arc::clone(&pty),
        sub_id,
    };

    let mut initial = Vec::new();
    if !replay.is_empty() {
        initial.push(
            Event::default()
                .event("data")
                .data(json!({ "data": BASE64.encode(&replay), "replay": true }).to_string()),
        );
    }

    struct StreamState {
        rx: tokio::sync::mpsc::Receiver<Vec<u8>>,
        pty: std::sync::Arc<crate::pty::Pty>,
        _guard: DisconnectGuard,
        exited: bool,
    }

    let live = futures::stream::unfold(
        Some(StreamState {
            rx,
            pty,
            _guard: guard,
            exited: false,
        }),
        |state| async move {
            let mut s = state?;
            if let Some(chunk) = s.rx.recv().await {
                let ev = Event::default()
                    .event("data")
                    .data(json!({ "data": BASE64.encode(&chunk) }).to_string());
                return Some((ev, Some(s)));
            }
            // Channel closed: the PTY exited (or we were unsubscribed).
            if s.exited {
                return None;
            }
            s.exited = true;
            let info = s.pty.info().await;
            let ev = Event::default()
                .event("exit")
                .data(json!({ "exitCode": info.exit_code }).to_string());
            Some((ev, Some(s)))
        },
    );

    // After the exit event the next unfold call sees `exited` and ends.
    let stream = futures::stream::iter(initial)
        .chain(live)
        .map(Ok::<_, std::convert::Infallible>);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default().interval(std::time::Duration::from_secs(15))))
}
