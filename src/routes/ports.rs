//! Exposed-port endpoints.
//!
//! - `POST /api/expose-port` / `GET /api/exposed-ports` /
//!   `DELETE /api/exposed-ports/{port}`
//! - `POST /api/port-watch` — SSE readiness watch (`watching`, `ready`,
//!   `process_exited`, `error`)

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::SandboxError;
use crate::ports::{watch, ProbeMode, WatchEvent, WatchOptions};
use crate::AppState;

/// Request body for `POST /api/expose-port`.
#[derive(Debug, Deserialize)]
pub struct ExposePortRequest {
    pub port: u16,
    pub name: Option<String>,
}

/// `POST /api/expose-port`.
pub async fn expose(
    State(state): State<AppState>,
    Json(payload): Json<ExposePortRequest>,
) -> Result<Json<Value>, SandboxError> {
    let registration = state.ports.expose(payload.port, payload.name).await?;
    Ok(Json(json!({ "success": true, "port": registration })))
}

/// `GET /api/exposed-ports`.
pub async fn list(State(state): State<AppState>) -> Json<Value> {
    let ports = state.ports.list().await;
    Json(json!({ "count": ports.len(), "ports": ports }))
}

/// `DELETE /api/exposed-ports/{port}`.
pub async fn unexpose(
    State(state): State<AppState>,
    Path(port): Path<u16>,
) -> Result<Json<Value>, SandboxError> {
    state.ports.unexpose(port).await?;
    Ok(Json(json!({ "success": true, "port": port })))
}

/// Request body for `POST /api/port-watch`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortWatchRequest {
    pub port: u16,
    pub interval_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    /// `"tcp"` (default) or `"http"`.
    pub probe: Option<String>,
    /// Path for the HTTP probe (default `/`).
    pub path: Option<String>,
    /// Acceptable HTTP status range (defaults 200–399).
    pub status_min: Option<u16>,
    pub status_max: Option<u16>,
    /// End the watch with `process_exited` once this process is gone.
    pub process_id: Option<String>,
}

/// `POST /api/port-watch` — SSE until the port is ready (or the watch ends).
pub async fn port_watch(
    State(state): State<AppState>,
    Json(payload): Json<PortWatchRequest>,
) -> Result<impl IntoResponse, SandboxError> {
    if payload.port == 0 {
        return Err(SandboxError::validation("port must be between 1 and 65535"));
    }
    let probe = match payload.probe.as_deref() {
        None | Some("tcp") => ProbeMode::Tcp,
        Some("http") => ProbeMode::Http {
            path: payload.path.unwrap_or_else(|| "/".to_string()),
            min: payload.status_min.unwrap_or(200),
            max: payload.status_max.unwrap_or(399),
        },
        Some(other) => {
            return Err(SandboxError::validation(format!(
                "unknown probe mode: {other}"
            )))
        }
    };

    let rx = watch(
        WatchOptions {
            port: payload.port,
            interval_ms: payload.interval_ms,
            timeout_ms: payload.timeout_ms,
            probe,
            process_id: payload.process_id,
        },
        state.processes.clone(),
    );

    let stream = futures::stream::unfold(Some(rx), |state| async move {
        let mut rx = state?;
        let event = rx.recv().await?;
        let terminal = !matches!(event, WatchEvent::Watching { .. });
        let name = match &event {
            WatchEvent::Watching { .. } => "watching",
            WatchEvent::Ready { .. } => "ready",
            WatchEvent::ProcessExited { .. } => "process_exited",
            WatchEvent::Error { .. } => "error",
        };
        let sse = Event::default()
            .event(name)
            .data(serde_json::to_string(&event).unwrap_or_default());
        let next = if terminal { None } else { Some(rx) };
        Some((Ok::<_, std::convert::Infallible>(sse), next))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default().interval(std::time::Duration::from_secs(15))))
}
