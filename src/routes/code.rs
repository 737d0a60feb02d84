//! Interpreter endpoints.
//!
//! - `POST /api/execute/code` — run a code cell, streaming `stdout`,
//!   `stderr`, `result`, `execution_complete`, and `error` SSE events
//! - `POST /api/contexts` / `GET /api/contexts` / `DELETE /api/contexts/{id}`
//! - `GET /api/interpreter/health`

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::SandboxError;
use crate::interpreter::Language;
use crate::AppState;

/// Request body for `POST /api/execute/code`.
#[derive(Debug, Deserialize)]
pub struct ExecuteCodeRequest {
    pub code: String,
    pub context_id: Option<String>,
    pub language: Option<String>,
    pub timeout_ms: Option<u64>,
}

fn parse_language(raw: Option<&str>) -> Result<Option<Language>, SandboxError> {
    match raw {
        None => Ok(None),
        Some(raw) => Language::parse(raw)
            .map(Some)
            .ok_or_else(|| SandboxError::validation(format!("unknown language: {raw}"))),
    }
}

/// `POST /api/execute/code` — execute a cell, streaming the result.
///
/// The language is taken from the request, else from the context, else
/// defaults to python.
pub async fn execute_code(
    State(state): State<AppState>,
    Json(payload): Json<ExecuteCodeRequest>,
) -> Result<impl IntoResponse, SandboxError> {
    if payload.code.is_empty() {
        return Err(SandboxError::validation("code is required"));
    }
    let requested = parse_language(payload.language.as_deref())?;
    let language = match (&requested, &payload.context_id) {
        (Some(lang), _) => *lang,
        (None, Some(context_id)) => state
            .interpreters
            .get_context(context_id)
            .await
            .ok_or_else(|| SandboxError::not_found(format!("context {context_id} not found")))?
            .language,
        (None, None) => Language::Python,
    };

    let response = state
        .interpreters
        .execute(
            language,
            &payload.code,
            payload.context_id.as_deref(),
            payload.timeout_ms,
        )
        .await;

    // The worker protocol returns the whole cell result at once; re-frame it
    // as the event sequence stream consumers expect.
    let mut events: Vec<Event> = Vec::new();
    match response {
        Ok(result) => {
            if !result.stdout.is_empty() {
                events.push(
                    Event::default()
                        .event("stdout")
                        .data(json!({ "data": result.stdout }).to_string()),
                );
            }
            if !result.stderr.is_empty() {
                events.push(
                    Event::default()
                        .event("stderr")
                        .data(json!({ "data": result.stderr }).to_string()),
                );
            }
            for output in &result.outputs {
                events.push(
                    Event::default()
                        .event("result")
                        .data(serde_json::to_string(output).unwrap_or_default()),
                );
            }
            if let Some(error) = &result.error {
                events.push(
                    Event::default()
                        .event("error")
                        .data(json!({ "message": error }).to_string()),
                );
            }
            events.push(
                Event::default()
                    .event("execution_complete")
                    .data(json!({ "success": result.success }).to_string()),
            );
        }
        Err(e) => {
            events.push(Event::default().event("error").data(e.to_json()["error"].to_string()));
        }
    }

    let stream = futures::stream::iter(events).map(Ok::<_, std::convert::Infallible>);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default().interval(std::time::Duration::from_secs(15))))
}

/// Request body for `POST /api/contexts`.
#[derive(Debug, Default, Deserialize)]
pub struct CreateContextRequest {
    pub language: Option<String>,
    pub cwd: Option<String>,
}

/// `POST /api/contexts` — reserve a worker for a new interpreter context.
pub async fn create_context(
    State(state): State<AppState>,
    payload: Option<Json<CreateContextRequest>>,
) -> Result<Json<Value>, SandboxError> {
    let payload = payload.map(|Json(p)| p).unwrap_or_default();
    let language = parse_language(payload.language.as_deref())?.unwrap_or(Language::Python);
    let info = state
        .interpreters
        .create_context(language, payload.cwd.as_deref())
        .await?;
    Ok(Json(json!({
        "contextId": info.id,
        "language": info.language,
        "cwd": info.cwd,
    })))
}

/// `GET /api/contexts`.
pub async fn list_contexts(State(state): State<AppState>) -> Json<Value> {
    let contexts = state.interpreters.list_contexts().await;
    Json(json!({ "contexts": contexts }))
}

/// `DELETE /api/contexts/{id}`.
pub async fn delete_context(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, SandboxError> {
    let info = state.interpreters.release_context(&id).await?;
    Ok(Json(json!({ "contextId": info.id })))
}

/// `GET /api/interpreter/health`.
pub async fn interpreter_health(State(state): State<AppState>) -> Json<Value> {
    let health = state.interpreters.health();
    Json(json!({
        "ready": health.ready,
        "initializing": health.initializing,
        "progress": health.progress,
    }))
}
