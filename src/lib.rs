#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! sandboxd library — the sandbox execution runtime behind the HTTP/WS API.
//!
//! Key building blocks:
//! - `sessions` — persistent shell sessions, command IPC, kill tracking
//! - `process` — background-process record store (memory + disk tiers)
//! - `interpreter` — pre-warmed Python/JavaScript/TypeScript worker pools
//! - `pty` — pseudo-terminal lifecycle with replay and fan-out
//! - `ports` — exposed-port registry and readiness watching
//! - `ws` — the WebSocket ↔ HTTP multiplexer
//! - `routes` — REST/SSE route handlers
//! - `sse` — incremental `text/event-stream` parser

pub mod config;
pub mod error;
pub mod interpreter;
pub mod ports;
pub mod process;
pub mod pty;
pub mod routes;
pub mod sessions;
pub mod sse;
pub mod state;
pub mod util;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::{ErrorKind, SandboxError};
pub use sessions::SessionManager;
pub use state::AppState;
