#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # sandboxd
//!
//! Sandbox execution runtime for Linux containers.
//!
//! sandboxd exposes HTTP, WebSocket, and SSE APIs that let a host execute
//! shell commands in persistent sessions, run Python/JavaScript/TypeScript
//! code on pre-warmed interpreter workers, drive pseudo-terminals, and
//! forward traffic to exposed container ports.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{any, delete, get, post};
use axum::{Extension, Router};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use sandboxd::interpreter::pool::InterpreterPool;
use sandboxd::ports::PortRegistry;
use sandboxd::process::{ProcessStore, DEFAULT_PROCESS_DIR};
use sandboxd::pty::PtyManager;
use sandboxd::routes;
use sandboxd::sessions::{self, SessionManager};
use sandboxd::state::AppState;
use sandboxd::ws::{self, InnerRouter};
use sandboxd::Config;

/// Sandbox execution runtime for Linux containers.
#[derive(Parser)]
#[command(name = "sandboxd", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    run_server(config_path.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("sandboxd v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    let temp_base = std::path::PathBuf::from(&config.session.temp_dir);

    let session_manager = SessionManager::new(&config.session);
    let processes = ProcessStore::new(DEFAULT_PROCESS_DIR, config.session.max_output_size_bytes);
    let interpreters = InterpreterPool::new(
        config.interpreter.clone(),
        &config.session.default_cwd,
        &temp_base,
    )
    .expect("failed to initialize interpreter pool");
    let ptys = PtyManager::new(config.pty.clone());
    let ports = PortRegistry::new();

    let state = AppState {
        config: Arc::new(config),
        start_time: Instant::now(),
        sessions: session_manager,
        processes,
        interpreters,
        ptys,
        ports,
    };

    // Probe + pre-warm in the background so the server binds immediately;
    // /api/interpreter/health reports progress.
    let warm_pool = Arc::clone(&state.interpreters);
    tokio::spawn(async move {
        warm_pool.initialize().await;
    });

    // Periodic sweep for IPC files orphaned by timeouts and kills.
    let sweep_interval = Duration::from_millis(state.config.session.cleanup_interval_ms.max(1000));
    let sweep_max_age = Duration::from_millis(state.config.session.temp_file_max_age_ms);
    let sweep_base = temp_base.clone();
    let sweep_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            sessions::sweep_stale_ipc_files(&sweep_base, sweep_max_age).await;
        }
    });

    let api = Router::new()
        .route("/api/health", get(routes::health::health))
        .route("/api/execute", post(routes::execute::execute))
        .route("/api/execute/stream", post(routes::execute::execute_stream))
        .route("/api/execute/code", post(routes::code::execute_code))
        .route("/api/process/start", post(routes::process::start))
        .route("/api/process/list", get(routes::process::list))
        .route("/api/process/kill-all", delete(routes::process::kill_all))
        .route(
            "/api/process/{id}",
            get(routes::process::get).delete(routes::process::kill),
        )
        .route("/api/process/{id}/logs", get(routes::process::logs))
        .route("/api/process/{id}/stream", get(routes::process::stream))
        .route(
            "/api/contexts",
            post(routes::code::create_context).get(routes::code::list_contexts),
        )
        .route("/api/contexts/{id}", delete(routes::code::delete_context))
        .route(
            "/api/interpreter/health",
            get(routes::code::interpreter_health),
        )
        .route("/api/pty", post(routes::pty::create).get(routes::pty::list))
        .route(
            "/api/pty/{id}",
            get(routes::pty::get).delete(routes::pty::remove),
        )
        .route("/api/pty/{id}/input", post(routes::pty::input))
        .route("/api/pty/{id}/resize", post(routes::pty::resize))
        .route("/api/pty/{id}/stream", get(routes::pty::stream))
        .route("/api/expose-port", post(routes::ports::expose))
        .route("/api/exposed-ports", get(routes::ports::list))
        .route(
            "/api/exposed-ports/{port}",
            delete(routes::ports::unexpose),
        )
        .route("/api/port-watch", post(routes::ports::port_watch))
        .route("/proxy/{port}/{*path}", any(routes::proxy::proxy))
        .with_state(state.clone());

    // The WS multiplexer dispatches frames through the same router HTTP
    // clients hit; hand it the finished (stateless) router via an extension.
    let app = api
        .clone()
        .route("/api/ws", get(ws::ws_upgrade))
        .layer(Extension(InnerRouter(api)))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(
            state.config.server.max_connections,
        ));

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Graceful shutdown on SIGINT/SIGTERM.
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Shutting down...");
    sweep_task.abort();
    state.sessions.destroy_all().await;
    state.interpreters.shutdown().await;
    state.ptys.shutdown().await;
    info!("Goodbye");
}
