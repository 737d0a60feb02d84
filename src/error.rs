//! Error taxonomy shared by every component and the HTTP surface.
//!
//! Components return `Result<T, SandboxError>`; the axum layer converts the
//! error into `{"success":false,"error":{"code","message","details"?}}` with
//! a status derived from the kind. Errors never travel as panics — recoverable
//! conditions (client disconnect mid-stream) are logged at `debug` and
//! swallowed at the site that observes them.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

/// Semantic error kinds (status mapping in [`ErrorKind::status`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input: bad port range, missing field, unknown language.
    Validation,
    /// No such session, process, context, PTY, or port.
    NotFound,
    /// Session exists, port already exposed.
    Conflict,
    /// Language mismatch, write to exited PTY, execute on a dead context worker.
    Precondition,
    /// Interpreter pool still pre-warming.
    InterpreterNotReady,
    /// Requested language has no runtime installed (e.g. python3 missing).
    LanguageUnavailable,
    /// User-configured or framework deadline hit.
    Timeout,
    /// Max workers per language reached.
    ResourceExhausted,
    /// The backing shell terminated unexpectedly.
    ShellDied,
    /// The backing interpreter worker terminated unexpectedly.
    WorkerDied,
    /// Temp-file read/write or upstream fetch failure.
    Io,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// Stable machine-readable code carried on the wire.
    pub fn code(self) -> &'static str {
        match self {
            Self::Validation => "INVALID_REQUEST",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::Precondition => "PRECONDITION_FAILED",
            Self::InterpreterNotReady => "INTERPRETER_NOT_READY",
            Self::LanguageUnavailable => "LANGUAGE_UNAVAILABLE",
            Self::Timeout => "TIMEOUT",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::ShellDied => "SHELL_DIED",
            Self::WorkerDied => "WORKER_DIED",
            Self::Io => "IO_ERROR",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    pub fn status(self) -> StatusCode {
        match self {
            Self::Validation => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::Precondition => StatusCode::GONE,
            Self::InterpreterNotReady | Self::LanguageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
            Self::ShellDied | Self::WorkerDied | Self::Io | Self::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// An error carrying a kind, a human-readable message, and optional details.
#[derive(Debug, Clone)]
pub struct SandboxError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<Value>,
}

impl SandboxError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Override the wire code while keeping the kind's status (used for
    /// codes like `COMMAND_NOT_FOUND` that are more specific than the kind).
    pub fn with_code(self, code: &'static str) -> CodedError {
        CodedError { inner: self, code }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    /// The standardized kill-miss error: kind `NotFound`, wire code
    /// `COMMAND_NOT_FOUND` (killing an unknown or already-completed command).
    pub fn command_not_found(command_id: &str) -> CodedError {
        Self::new(
            ErrorKind::NotFound,
            format!("command {command_id} not found"),
        )
        .with_code("COMMAND_NOT_FOUND")
    }

    /// Serialize to the wire error object.
    pub fn to_json(&self) -> Value {
        self.to_json_with_code(self.kind.code())
    }

    fn to_json_with_code(&self, code: &str) -> Value {
        let mut err = json!({ "code": code, "message": self.message });
        if let Some(ref d) = self.details {
            err["details"] = d.clone();
        }
        json!({ "success": false, "error": err })
    }
}

impl std::fmt::Display for SandboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

impl std::error::Error for SandboxError {}

impl From<std::io::Error> for SandboxError {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, e.to_string())
    }
}

impl IntoResponse for SandboxError {
    fn into_response(self) -> Response {
        (self.kind.status(), Json(self.to_json())).into_response()
    }
}

/// A [`SandboxError`] with an overridden wire code.
#[derive(Debug, Clone)]
pub struct CodedError {
    inner: SandboxError,
    code: &'static str,
}

impl IntoResponse for CodedError {
    fn into_response(self) -> Response {
        (
            self.inner.kind.status(),
            Json(self.inner.to_json_with_code(self.code)),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ErrorKind::Validation.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorKind::Conflict.status(), StatusCode::CONFLICT);
        assert_eq!(ErrorKind::Precondition.status(), StatusCode::GONE);
        assert_eq!(ErrorKind::Timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            ErrorKind::ResourceExhausted.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn wire_shape() {
        let e = SandboxError::not_found("session s1 not found");
        let v = e.to_json();
        assert_eq!(v["success"], false);
        assert_eq!(v["error"]["code"], "NOT_FOUND");
        assert_eq!(v["error"]["message"], "session s1 not found");
        assert!(v["error"].get("details").is_none());
    }

    #[test]
    fn details_carried() {
        let e = SandboxError::validation("port out of range")
            .with_details(json!({"port": 99999}));
        let v = e.to_json();
        assert_eq!(v["error"]["details"]["port"], 99999);
    }
}
