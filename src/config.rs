//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — the container contract
//!    (`SESSION_CWD`, `SESSION_ISOLATED`, `COMMAND_TIMEOUT_MS`, `TEMP_DIR`,
//!    `<LANG>_POOL_MIN_SIZE`, …) plus `SANDBOXD_LISTEN`
//! 2. **Config file** — path via `--config <path>`, or `sandboxd.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:3000"
//!
//! [session]
//! default_cwd = "/workspace"
//! isolated = false
//! command_timeout_ms = 300000
//! temp_dir = "/tmp"
//! cleanup_interval_ms = 60000
//! temp_file_max_age_ms = 300000
//! max_output_size_bytes = 1048576
//!
//! [interpreter]
//! spawn_timeout_ms = 10000
//! execution_timeout_ms = 30000
//!
//! [interpreter.python]
//! min_size = 1
//! max_processes = 4
//! idle_timeout_ms = 300000
//!
//! [pty]
//! replay_buffer_bytes = 262144
//! disconnect_timeout_ms = 60000
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub interpreter: InterpreterConfig,
    #[serde(default)]
    pub pty: PtyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:3000`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrent connections (default 256).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Shell session defaults and temp-file hygiene.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Default session id used when requests omit one.
    #[serde(default = "default_session_id")]
    pub default_session_id: String,
    /// Working directory for new sessions (default `/workspace`).
    #[serde(default = "default_cwd")]
    pub default_cwd: String,
    /// Run shells under a new PID namespace (default false).
    #[serde(default)]
    pub isolated: bool,
    /// Default command timeout in milliseconds (default 300 000).
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Base directory for per-session IPC temp dirs (default `/tmp`).
    #[serde(default = "default_temp_dir")]
    pub temp_dir: String,
    /// Period of the stale-temp-file sweeper in milliseconds (default 60 000).
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    /// Age past which orphaned IPC files are deleted (default 300 000 ms).
    #[serde(default = "default_temp_file_max_age_ms")]
    pub temp_file_max_age_ms: u64,
    /// Cap on accumulated stdout/stderr per command (default 1 MiB).
    #[serde(default = "default_max_output_size_bytes")]
    pub max_output_size_bytes: usize,
}

/// Interpreter pool settings, per language plus shared timeouts.
#[derive(Debug, Clone, Deserialize)]
pub struct InterpreterConfig {
    /// Worker ready-handshake deadline in milliseconds (default 10 000).
    #[serde(default = "default_spawn_timeout_ms")]
    pub spawn_timeout_ms: u64,
    /// Default per-execution deadline in milliseconds (default 30 000).
    #[serde(default = "default_execution_timeout_ms")]
    pub execution_timeout_ms: u64,
    #[serde(default)]
    pub python: PoolConfig,
    #[serde(default)]
    pub javascript: PoolConfig,
    #[serde(default)]
    pub typescript: PoolConfig,
}

/// Sizing for one language's worker pool.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Workers kept pre-warmed and available (default 1).
    #[serde(default = "default_pool_min_size")]
    pub min_size: usize,
    /// Hard cap on workers for the language; `None` = unbounded.
    #[serde(default = "default_pool_max_processes")]
    pub max_processes: Option<usize>,
    /// Idle age past which surplus available workers are evicted (default 300 000 ms).
    #[serde(default = "default_pool_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

/// PTY manager settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PtyConfig {
    /// Bytes of recent output retained for reconnect replay (default 256 KiB).
    #[serde(default = "default_replay_buffer_bytes")]
    pub replay_buffer_bytes: usize,
    /// Grace period before an unattended PTY is killed (default 60 000 ms;
    /// 0 disables the disconnect timer).
    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,
    /// Default terminal size for new PTYs.
    #[serde(default = "default_terminal_cols")]
    pub default_cols: u16,
    #[serde(default = "default_terminal_rows")]
    pub default_rows: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:3000".to_string()
}
fn default_max_connections() -> usize {
    256
}
fn default_session_id() -> String {
    "default".to_string()
}
fn default_cwd() -> String {
    "/workspace".to_string()
}
fn default_command_timeout_ms() -> u64 {
    300_000
}
fn default_temp_dir() -> String {
    "/tmp".to_string()
}
fn default_cleanup_interval_ms() -> u64 {
    60_000
}
fn default_temp_file_max_age_ms() -> u64 {
    300_000
}
fn default_max_output_size_bytes() -> usize {
    1024 * 1024
}
fn default_spawn_timeout_ms() -> u64 {
    10_000
}
fn default_execution_timeout_ms() -> u64 {
    30_000
}
fn default_pool_min_size() -> usize {
    1
}
fn default_pool_max_processes() -> Option<usize> {
    Some(4)
}
fn default_pool_idle_timeout_ms() -> u64 {
    300_000
}
fn default_replay_buffer_bytes() -> usize {
    256 * 1024
}
fn default_disconnect_timeout_ms() -> u64 {
    60_000
}
fn default_terminal_cols() -> u16 {
    80
}
fn default_terminal_rows() -> u16 {
    24
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_session_id: default_session_id(),
            default_cwd: default_cwd(),
            isolated: false,
            command_timeout_ms: default_command_timeout_ms(),
            temp_dir: default_temp_dir(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            temp_file_max_age_ms: default_temp_file_max_age_ms(),
            max_output_size_bytes: default_max_output_size_bytes(),
        }
    }
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            spawn_timeout_ms: default_spawn_timeout_ms(),
            execution_timeout_ms: default_execution_timeout_ms(),
            python: PoolConfig::default(),
            javascript: PoolConfig::default(),
            typescript: PoolConfig::default(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: default_pool_min_size(),
            max_processes: default_pool_max_processes(),
            idle_timeout_ms: default_pool_idle_timeout_ms(),
        }
    }
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            replay_buffer_bytes: default_replay_buffer_bytes(),
            disconnect_timeout_ms: default_disconnect_timeout_ms(),
            default_cols: default_terminal_cols(),
            default_rows: default_terminal_rows(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            session: SessionConfig::default(),
            interpreter: InterpreterConfig::default(),
            pty: PtyConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure, this runs
    /// before the server binds). Otherwise looks for `sandboxd.toml` in the
    /// current directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("sandboxd.toml").exists() {
            let content =
                std::fs::read_to_string("sandboxd.toml").expect("Failed to read sandboxd.toml");
            toml::from_str(&content).expect("Failed to parse sandboxd.toml")
        } else {
            Config::default()
        };

        config.apply_env();
        config
    }

    /// Apply the container environment contract on top of file/default values.
    fn apply_env(&mut self) {
        if let Ok(listen) = std::env::var("SANDBOXD_LISTEN") {
            self.server.listen = listen;
        }
        if let Ok(id) = std::env::var("SESSION_ID") {
            self.session.default_session_id = id;
        }
        if let Ok(cwd) = std::env::var("SESSION_CWD") {
            self.session.default_cwd = cwd;
        }
        if let Ok(v) = std::env::var("SESSION_ISOLATED") {
            self.session.isolated = v == "1";
        }
        if let Some(v) = env_u64("COMMAND_TIMEOUT_MS") {
            self.session.command_timeout_ms = v;
        }
        if let Some(v) = env_u64("CLEANUP_INTERVAL_MS") {
            self.session.cleanup_interval_ms = v;
        }
        if let Some(v) = env_u64("TEMP_FILE_MAX_AGE_MS") {
            self.session.temp_file_max_age_ms = v;
        }
        if let Ok(dir) = std::env::var("TEMP_DIR") {
            self.session.temp_dir = dir;
        }
        if let Some(v) = env_usize("MAX_OUTPUT_SIZE_BYTES") {
            self.session.max_output_size_bytes = v;
        }
        if let Some(v) = env_u64("INTERPRETER_SPAWN_TIMEOUT_MS") {
            self.interpreter.spawn_timeout_ms = v;
        }
        if let Some(v) = env_u64("INTERPRETER_EXECUTION_TIMEOUT_MS") {
            self.interpreter.execution_timeout_ms = v;
        }
        for (lang, pool) in [
            ("PYTHON", &mut self.interpreter.python),
            ("JAVASCRIPT", &mut self.interpreter.javascript),
            ("TYPESCRIPT", &mut self.interpreter.typescript),
        ] {
            if let Some(v) = env_usize(&format!("{lang}_POOL_MIN_SIZE")) {
                pool.min_size = v;
            }
            if let Some(v) = env_usize(&format!("{lang}_POOL_MAX_SIZE")) {
                pool.max_processes = Some(v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.server.listen, "0.0.0.0:3000");
        assert_eq!(c.session.default_cwd, "/workspace");
        assert!(!c.session.isolated);
        assert_eq!(c.interpreter.python.min_size, 1);
        assert_eq!(c.pty.default_cols, 80);
    }

    #[test]
    fn toml_overrides() {
        let c: Config = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:9000"

            [session]
            isolated = true
            command_timeout_ms = 1000

            [interpreter.python]
            min_size = 3
            max_processes = 8
            "#,
        )
        .unwrap();
        assert_eq!(c.server.listen, "127.0.0.1:9000");
        assert!(c.session.isolated);
        assert_eq!(c.session.command_timeout_ms, 1000);
        assert_eq!(c.interpreter.python.min_size, 3);
        assert_eq!(c.interpreter.python.max_processes, Some(8));
        // untouched sections keep defaults
        assert_eq!(c.session.temp_dir, "/tmp");
    }
}
