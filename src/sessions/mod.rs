//! Session lifecycle management.
//!
//! [`SessionManager`] is the single authority for creating, accessing, and
//! destroying sessions. A session is a named execution context owning one
//! lazily-spawned [`ShellSession`]; its working directory and environment
//! persist across requests.
//!
//! ## Concurrency
//!
//! The session table is behind an `RwLock`; `get_or_create` holds the write
//! lock across the check-and-insert so duplicate concurrent requests coalesce
//! onto the same entry. Each session carries its own `tokio::Mutex` that
//! serializes command execution — commands on one session run in submission
//! order, commands on different sessions run in parallel.
//!
//! Streaming executions are registered in the [`CommandRegistry`] and have
//! their first event queued *before* the call returns, so a kill issued
//! immediately afterwards always finds the command (track-before-return).

pub mod command;
pub mod shell;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{ErrorKind, SandboxError};
use command::CommandRegistry;
use shell::{ExecOutcome, ShellSession, StreamEvent};

/// Options applied when a session is first created; ignored on later lookups.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub isolated: Option<bool>,
}

/// A named execution context. The shell is spawned on first use.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub cwd: String,
    pub env: HashMap<String, String>,
    /// Isolation requested at creation (the shell records the actual state).
    pub isolated: bool,
    /// Serializes command execution and shell creation for this session.
    mutex: Arc<Mutex<()>>,
    shell: Mutex<Option<Arc<ShellSession>>>,
}

/// Handle passed to [`SessionManager::with_session`] bodies: executes
/// commands on an already-locked session.
pub struct AtomicSession {
    shell: Arc<ShellSession>,
    default_timeout: Duration,
}

impl AtomicSession {
    /// Run one command without re-acquiring the session mutex (the caller's
    /// scope already holds it).
    pub async fn exec(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout_ms: Option<u64>,
    ) -> Result<ExecOutcome, SandboxError> {
        let id = uuid::Uuid::new_v4().to_string();
        let timeout = timeout_ms.map_or(self.default_timeout, Duration::from_millis);
        self.shell.exec(&id, command, cwd, timeout).await
    }
}

/// Manages the pool of sessions. Cloneable — clones share the same state.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    pub registry: CommandRegistry,
    temp_dir: PathBuf,
    default_cwd: String,
    default_isolated: bool,
    default_timeout: Duration,
    max_output: usize,
}

impl SessionManager {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            registry: CommandRegistry::new(),
            temp_dir: PathBuf::from(&config.temp_dir),
            default_cwd: config.default_cwd.clone(),
            default_isolated: config.isolated,
            default_timeout: Duration::from_millis(config.command_timeout_ms),
            max_output: config.max_output_size_bytes,
        }
    }

    /// Get a session, creating it if absent. Holds the write lock across
    /// check-and-insert so concurrent callers coalesce.
    pub async fn get_or_create(&self, id: &str, opts: SessionOptions) -> Arc<Session> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(id) {
                return Arc::clone(session);
            }
        }
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(id) {
            return Arc::clone(session);
        }
        let session = Arc::new(Session {
            id: id.to_string(),
            cwd: opts.cwd.unwrap_or_else(|| self.default_cwd.clone()),
            env: opts.env,
            isolated: opts.isolated.unwrap_or(self.default_isolated),
            mutex: Arc::new(Mutex::new(())),
            shell: Mutex::new(None),
        });
        sessions.insert(id.to_string(), Arc::clone(&session));
        info!("session {id} created (cwd={}, isolated={})", session.cwd, session.isolated);
        session
    }

    /// Create a session explicitly; `Conflict` if the id is taken.
    pub async fn create(&self, id: &str, opts: SessionOptions) -> Result<Arc<Session>, SandboxError> {
        {
            let sessions = self.sessions.read().await;
            if sessions.contains_key(id) {
                return Err(SandboxError::conflict(format!("session {id} already exists")));
            }
        }
        Ok(self.get_or_create(id, opts).await)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).map(Arc::clone)
    }

    /// Spawn (or fetch) the session's shell. Fails with `SHELL_DIED` once a
    /// shell has died — the session must be destroyed and recreated.
    async fn ensure_shell(&self, session: &Session) -> Result<Arc<ShellSession>, SandboxError> {
        let mut slot = session.shell.lock().await;
        if let Some(shell) = slot.as_ref() {
            if shell.is_alive() {
                return Ok(Arc::clone(shell));
            }
            return Err(SandboxError::new(
                ErrorKind::ShellDied,
                format!("shell for session {} is not alive", session.id),
            ));
        }

        let cwd = self.usable_cwd(&session.cwd);
        let shell = ShellSession::spawn(
            &session.id,
            &cwd,
            &session.env,
            session.isolated,
            &self.temp_dir,
            self.max_output,
        )
        .await?;
        let shell = Arc::new(shell);
        *slot = Some(Arc::clone(&shell));
        Ok(shell)
    }

    /// The configured cwd, created on demand; falls back to `/` when it
    /// cannot be created (the container normally guarantees it exists).
    fn usable_cwd(&self, cwd: &str) -> String {
        if std::path::Path::new(cwd).is_dir() {
            return cwd.to_string();
        }
        match std::fs::create_dir_all(cwd) {
            Ok(()) => cwd.to_string(),
            Err(e) => {
                warn!("cwd {cwd} unavailable ({e}), falling back to /");
                "/".to_string()
            }
        }
    }

    /// Execute a command synchronously under the session mutex.
    pub async fn exec(
        &self,
        id: &str,
        command: &str,
        cwd: Option<&str>,
        timeout_ms: Option<u64>,
    ) -> Result<ExecOutcome, SandboxError> {
        let session = self.get_or_create(id, SessionOptions::default()).await;
        let _guard = session.mutex.lock().await;
        let shell = self.ensure_shell(&session).await?;
        let command_id = uuid::Uuid::new_v4().to_string();
        let timeout = timeout_ms.map_or(self.default_timeout, Duration::from_millis);
        shell.exec(&command_id, command, cwd, timeout).await
    }

    /// Begin a streaming execution.
    ///
    /// The command is registered in the [`CommandRegistry`] and its `start`
    /// event queued before this returns. With `background = false` the
    /// session mutex is held until the stream completes; with
    /// `background = true` it is released after the first event and the
    /// remainder streams on a detached pump.
    pub async fn exec_stream(
        &self,
        id: &str,
        command: &str,
        cwd: Option<&str>,
        command_id: &str,
        background: bool,
        timeout_ms: Option<u64>,
    ) -> Result<mpsc::Receiver<StreamEvent>, SandboxError> {
        let session = self.get_or_create(id, SessionOptions::default()).await;
        let guard = Arc::clone(&session.mutex).lock_owned().await;
        let shell = match self.ensure_shell(&session).await {
            Ok(s) => s,
            Err(e) => {
                drop(guard);
                return Err(e);
            }
        };

        let timeout = timeout_ms.map(Duration::from_millis);
        let (inner_rx, pid) = match shell.exec_stream(command_id, command, cwd, timeout).await {
            Ok(pair) => pair,
            Err(e) => {
                drop(guard);
                return Err(e);
            }
        };

        // Track before the caller sees the stream — a kill issued the moment
        // this function returns must find the command.
        self.registry.track(id, command_id, pid).await;

        let (out_tx, out_rx) = mpsc::channel(256);
        let registry = self.registry.clone();
        let sid = id.to_string();
        let cid = command_id.to_string();
        tokio::spawn(pump_stream(
            inner_rx, out_tx, guard, background, registry, sid, cid,
        ));

        Ok(out_rx)
    }

    /// Run `body` with exclusive access to the session: no other command can
    /// interleave until the returned future resolves. The lock is released
    /// on every exit path, including errors and panics (guard drop).
    pub async fn with_session<T, F, Fut>(&self, id: &str, body: F) -> Result<T, SandboxError>
    where
        F: FnOnce(AtomicSession) -> Fut,
        Fut: std::future::Future<Output = Result<T, SandboxError>>,
    {
        let session = self.get_or_create(id, SessionOptions::default()).await;
        let _guard = session.mutex.lock().await;
        let shell = self.ensure_shell(&session).await?;
        body(AtomicSession {
            shell,
            default_timeout: self.default_timeout,
        })
        .await
    }

    /// Set environment variables on the session's shell (persisting for all
    /// subsequent commands).
    pub async fn set_env_vars(
        &self,
        id: &str,
        vars: &HashMap<String, String>,
    ) -> Result<(), SandboxError> {
        let session = self.get_or_create(id, SessionOptions::default()).await;
        let _guard = session.mutex.lock().await;
        let shell = self.ensure_shell(&session).await?;
        for (k, v) in vars {
            shell.set_env_var(k, v).await?;
        }
        Ok(())
    }

    /// Kill a tracked command: signal its child and emit the synthetic
    /// `complete` on its stream.
    pub async fn kill_command(
        &self,
        session_id: &str,
        command_id: &str,
        signal: i32,
    ) -> Result<(), SandboxError> {
        let signal = self.registry.kill(session_id, command_id, signal).await?;
        if let Some(session) = self.get(session_id).await {
            let shell = session.shell.lock().await.clone();
            if let Some(shell) = shell {
                shell.finish_killed(command_id, signal).await;
            }
        }
        Ok(())
    }

    /// Kill every tracked command across all sessions. Returns the handles
    /// that were killed.
    pub async fn kill_all_commands(&self, signal: i32) -> Vec<command::CommandHandle> {
        let handles = self.registry.kill_all(signal).await;
        for handle in &handles {
            if let Some(session) = self.get(&handle.session_id).await {
                let shell = session.shell.lock().await.clone();
                if let Some(shell) = shell {
                    shell.finish_killed(&handle.command_id, signal).await;
                }
            }
        }
        handles
    }

    /// Destroy a session: kill its shell (and process group) and remove the
    /// entry. Returns false if the session did not exist.
    pub async fn destroy(&self, id: &str) -> bool {
        let entry = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(id)
        };
        let Some(session) = entry else {
            return false;
        };
        let shell = session.shell.lock().await.clone();
        if let Some(shell) = shell {
            shell.destroy().await;
        }
        info!("session {id} destroyed");
        true
    }

    /// Destroy every session (container shutdown).
    pub async fn destroy_all(&self) {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        let count = drained.len();
        for session in drained {
            let shell = session.shell.lock().await.clone();
            if let Some(shell) = shell {
                shell.destroy().await;
            }
        }
        if count > 0 {
            info!("destroyed {count} session(s)");
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Delete IPC files older than `max_age` from every session temp dir under
/// `temp_base`. Timed-out and killed commands can leave files behind (their
/// wrapper still writes the exit file after we stopped listening); this
/// sweep is their backstop. Returns the number of files removed.
pub async fn sweep_stale_ipc_files(temp_base: &std::path::Path, max_age: Duration) -> usize {
    let mut removed = 0;
    let Ok(mut base) = tokio::fs::read_dir(temp_base).await else {
        return 0;
    };
    while let Ok(Some(dir)) = base.next_entry().await {
        let name = dir.file_name();
        if !name.to_string_lossy().starts_with("sandbox_") {
            continue;
        }
        let Ok(mut files) = tokio::fs::read_dir(dir.path()).await else {
            continue;
        };
        while let Ok(Some(file)) = files.next_entry().await {
            let Ok(meta) = file.metadata().await else {
                continue;
            };
            let stale = meta
                .modified()
                .ok()
                .and_then(|m| m.elapsed().ok())
                .is_some_and(|age| age > max_age);
            if stale && tokio::fs::remove_file(file.path()).await.is_ok() {
                removed += 1;
            }
        }
    }
    if removed > 0 {
        debug!("swept {removed} stale IPC file(s)");
    }
    removed
}

/// Forward events from the shell to the caller, releasing the session mutex
/// at the right moment and untracking the command when it terminates.
async fn pump_stream(
    mut inner_rx: mpsc::Receiver<StreamEvent>,
    out_tx: mpsc::Sender<StreamEvent>,
    guard: OwnedMutexGuard<()>,
    background: bool,
    registry: CommandRegistry,
    session_id: String,
    command_id: String,
) {
    let mut guard = Some(guard);
    let mut first = true;
    while let Some(event) = inner_rx.recv().await {
        let terminal = matches!(
            event,
            StreamEvent::Complete { .. } | StreamEvent::Error { .. }
        );
        if out_tx.send(event).await.is_err() {
            // Consumer went away (client disconnect). Benign — keep draining
            // so the mutex is still released when the command finishes.
            debug!("stream consumer for {command_id} dropped");
        }
        if first {
            first = false;
            if background {
                guard.take();
            }
        }
        if terminal {
            break;
        }
    }
    drop(guard.take());
    registry.untrack(&session_id, &command_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (SessionManager, tempfile::TempDir) {
        let base = tempfile::tempdir().unwrap();
        let config = SessionConfig {
            default_cwd: "/tmp".to_string(),
            temp_dir: base.path().to_string_lossy().into_owned(),
            ..SessionConfig::default()
        };
        (SessionManager::new(&config), base)
    }

    #[tokio::test]
    async fn exec_round_trip() {
        let (mgr, _base) = manager();
        let out = mgr.exec("s1", "echo hi", None, None).await.unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, "hi\n");
        mgr.destroy_all().await;
    }

    #[tokio::test]
    async fn cwd_persists_between_manager_execs() {
        let (mgr, _base) = manager();
        let first = mgr.exec("s2", "cd /tmp && pwd", None, None).await.unwrap();
        assert_eq!(first.stdout, "/tmp\n");
        let second = mgr.exec("s2", "pwd", None, None).await.unwrap();
        assert_eq!(second.stdout, "/tmp\n");
        mgr.destroy_all().await;
    }

    #[tokio::test]
    async fn concurrent_with_session_bodies_serialize() {
        let (mgr, _base) = manager();
        let _ = std::fs::remove_file("/tmp/sandboxd_atomic_test");
        // Warm the shell so both bodies contend only on the session mutex.
        mgr.exec("atomic", "true", None, None).await.unwrap();

        let a = mgr.with_session("atomic", |s| async move {
            s.exec("echo A1 >> /tmp/sandboxd_atomic_test", None, None).await?;
            tokio::time::sleep(Duration::from_millis(50)).await;
            s.exec("echo A2 >> /tmp/sandboxd_atomic_test", None, None).await
        });
        let b = mgr.with_session("atomic", |s| async move {
            s.exec("echo B1 >> /tmp/sandboxd_atomic_test", None, None).await?;
            tokio::time::sleep(Duration::from_millis(50)).await;
            s.exec("echo B2 >> /tmp/sandboxd_atomic_test", None, None).await
        });
        let (ra, rb) = tokio::join!(a, b);
        ra.unwrap();
        rb.unwrap();

        let content = tokio::fs::read_to_string("/tmp/sandboxd_atomic_test")
            .await
            .unwrap();
        let _ = tokio::fs::remove_file("/tmp/sandboxd_atomic_test").await;
        // Whichever body ran first, its two lines are adjacent.
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(
            lines == ["A1", "A2", "B1", "B2"] || lines == ["B1", "B2", "A1", "A2"],
            "interleaved: {lines:?}"
        );
        mgr.destroy_all().await;
    }

    #[tokio::test]
    async fn kill_immediately_after_stream_start_succeeds() {
        let (mgr, _base) = manager();
        let command_id = uuid::Uuid::new_v4().to_string();
        let mut rx = mgr
            .exec_stream("s3", "sleep 10; echo done", None, &command_id, true, None)
            .await
            .unwrap();

        // Track-before-return: the kill must find the command.
        mgr.kill_command("s3", &command_id, libc::SIGKILL)
            .await
            .unwrap();

        let mut exit_code = None;
        let mut saw_done = false;
        while let Some(ev) = rx.recv().await {
            match ev {
                StreamEvent::Complete { exit_code: code } => {
                    exit_code = Some(code);
                    break;
                }
                StreamEvent::Stdout { data } if data.contains("done") => saw_done = true,
                _ => {}
            }
        }
        assert!(exit_code.is_some_and(|c| c != 0), "exit_code: {exit_code:?}");
        assert!(!saw_done);
        mgr.destroy_all().await;
    }

    #[tokio::test]
    async fn set_env_vars_persist_for_later_commands() {
        let (mgr, _base) = manager();
        let mut vars = HashMap::new();
        vars.insert("SANDBOXD_MGR_TEST".to_string(), "forty two".to_string());
        mgr.set_env_vars("env-session", &vars).await.unwrap();
        let out = mgr
            .exec("env-session", "echo \"$SANDBOXD_MGR_TEST\"", None, None)
            .await
            .unwrap();
        assert_eq!(out.stdout, "forty two\n");
        mgr.destroy_all().await;
    }

    #[tokio::test]
    async fn kill_unknown_command_reports_not_found() {
        let (mgr, _base) = manager();
        let err = mgr
            .kill_command("s4", "no-such-command", libc::SIGTERM)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn destroy_removes_session() {
        let (mgr, _base) = manager();
        mgr.exec("gone", "true", None, None).await.unwrap();
        assert!(mgr.destroy("gone").await);
        assert!(!mgr.destroy("gone").await);
        assert_eq!(mgr.session_count().await, 0);
    }

    #[tokio::test]
    async fn create_conflicts_on_duplicate() {
        let (mgr, _base) = manager();
        mgr.create("dup", SessionOptions::default()).await.unwrap();
        let err = mgr.create("dup", SessionOptions::default()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }
}
