//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::interpreter::pool::InterpreterPool;
use crate::ports::PortRegistry;
use crate::process::ProcessStore;
use crate::pty::PtyManager;
use crate::sessions::SessionManager;

/// Shared application state for the sandboxd server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Session table: persistent shells keyed by session id.
    pub sessions: SessionManager,
    /// Background-process records (live in memory, terminal on disk).
    pub processes: ProcessStore,
    /// Per-language interpreter worker pools and contexts.
    pub interpreters: Arc<InterpreterPool>,
    /// Pseudo-terminal manager.
    pub ptys: PtyManager,
    /// Exposed-port registry.
    pub ports: PortRegistry,
}
