//! Persistent shell session with temp-file command IPC.
//!
//! A [`ShellSession`] owns one long-lived `bash` (optionally wrapped in
//! `unshare` for PID-namespace isolation) and executes one command at a time
//! through it. Commands never travel through the shell's stdin directly —
//! the command text is written to a `cmd_*` file in the session's private
//! temp directory, and a small wrapper script piped to bash runs
//! `cat cmd | sh`, captures output and exit code into sibling files, and
//! prints a `DONE:<id>` marker on stdout. The stdout reader task parses
//! markers and resolves the pending command.
//!
//! ## Why the extra `cwd_*` file
//!
//! The child `sh` cannot change the parent bash's working directory, so the
//! command payload ends with an epilogue that records `pwd` into a transient
//! `cwd_*` file; the wrapper `cd`s to the recorded path after `wait`. This
//! is what makes `cd /tmp` in one command visible to the next.
//!
//! ## Kill and timeout
//!
//! The wrapper backgrounds the pipeline and prints `PID:<id>:$!` so the
//! command registry can deliver signals without another round-trip. For
//! streaming commands the `PID:` marker is printed *before*
//! `STREAM_STARTED:`, and [`ShellSession::exec_stream`] does not return
//! until the start marker has been parsed — a kill issued the moment the
//! call returns therefore always has a real PID to signal. A timeout
//! resolves the caller with an error and deletes the IPC files but leaves
//! the shell (and the user's child) running; the late marker is ignored
//! via the `processed` flag.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorKind, SandboxError};
use crate::util::{is_valid_env_name, now_ms, rand_suffix, shell_escape};

/// How often the streaming poller samples the output files.
const STREAM_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Grace period after spawn before the shell is considered ready (and
/// before an `unshare` failure is detected).
const SPAWN_GRACE: Duration = Duration::from_millis(100);

/// Synchronous command result.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Events emitted by a streaming execution, in source order.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Start {
        command_id: String,
        command: String,
        timestamp_ms: u64,
    },
    Stdout {
        data: String,
    },
    Stderr {
        data: String,
    },
    Complete {
        exit_code: i32,
    },
    Error {
        error: SandboxError,
    },
}

/// The four per-command IPC files plus the transient cwd-sync file.
#[derive(Debug, Clone)]
struct IpcFiles {
    cmd: PathBuf,
    out: PathBuf,
    err: PathBuf,
    exit: PathBuf,
    cwd: PathBuf,
}

impl IpcFiles {
    fn new(dir: &Path, id: &str) -> Self {
        let suffix = rand_suffix();
        Self {
            cmd: dir.join(format!("cmd_{id}_{suffix}")),
            out: dir.join(format!("out_{id}_{suffix}")),
            err: dir.join(format!("err_{id}_{suffix}")),
            exit: dir.join(format!("exit_{id}_{suffix}")),
            cwd: dir.join(format!("cwd_{id}_{suffix}")),
        }
    }

    /// Best-effort removal of every IPC file.
    async fn cleanup(&self) {
        for path in [&self.cmd, &self.out, &self.err, &self.exit, &self.cwd] {
            let _ = tokio::fs::remove_file(path).await;
        }
    }
}

/// Byte offsets already emitted by the streaming poller.
#[derive(Debug, Default)]
struct StreamOffsets {
    out: u64,
    err: u64,
    out_truncated: bool,
    err_truncated: bool,
}

#[derive(Debug)]
enum PendingKind {
    Sync {
        done: Option<oneshot::Sender<Result<ExecOutcome, SandboxError>>>,
    },
    Stream {
        events: mpsc::Sender<StreamEvent>,
        started: Option<oneshot::Sender<()>>,
        offsets: Arc<Mutex<StreamOffsets>>,
    },
}

/// Book-keeping for one in-flight command.
#[derive(Debug)]
struct Pending {
    command: String,
    files: IpcFiles,
    /// Set once by whichever of {marker, timeout, kill} wins the race.
    processed: Arc<AtomicBool>,
    /// PID of the `sh` child, captured from the `PID:` marker (0 = unknown).
    pid: Arc<AtomicI32>,
    cancel: CancellationToken,
    kind: PendingKind,
    start: std::time::Instant,
}

#[derive(Debug)]
struct ShellInner {
    session_id: String,
    pending: Mutex<HashMap<String, Pending>>,
    alive: AtomicBool,
    max_output: usize,
}

/// A running shell session.
#[derive(Debug)]
pub struct ShellSession {
    inner: Arc<ShellInner>,
    /// Process-unique IPC directory, mode 0700. Removed on destroy.
    pub temp_dir: PathBuf,
    /// Whether the shell actually runs in a PID namespace.
    pub isolated: bool,
    /// True when isolation was requested but the `unshare` spawn failed.
    pub isolation_fallback: bool,
    /// Shell (or `unshare`) PID; also its process group id.
    pub pid: u32,
    stdin_tx: mpsc::Sender<Vec<u8>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

fn bash_command(isolated: bool, cwd: &str, env: &HashMap<String, String>) -> Command {
    let mut cmd = if isolated {
        let mut c = Command::new("unshare");
        c.args(["--pid", "--fork", "--mount-proc", "bash", "--norc"]);
        c
    } else {
        let mut c = Command::new("bash");
        c.arg("--norc");
        c
    };
    cmd.current_dir(cwd)
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // SAFETY: setpgid is async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
    cmd
}

/// Spawn a stderr reader that flags `unshare:` diagnostics and logs the rest.
fn spawn_stderr_task(
    session_id: String,
    stderr: tokio::process::ChildStderr,
    saw_unshare: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.contains("unshare:") {
                saw_unshare.store(true, Ordering::SeqCst);
            }
            debug!("session {session_id} shell stderr: {line}");
        }
    })
}

impl ShellSession {
    /// Spawn a shell for `session_id`.
    ///
    /// Creates the owner-only temp directory, starts bash (under `unshare`
    /// when `isolated`), waits a short readiness grace, and falls back once
    /// to a plain bash if the isolated spawn failed or printed an
    /// `unshare:` diagnostic.
    pub async fn spawn(
        session_id: &str,
        cwd: &str,
        env: &HashMap<String, String>,
        isolated: bool,
        temp_base: &Path,
        max_output: usize,
    ) -> Result<Self, SandboxError> {
        let temp_dir = temp_base.join(format!(
            "sandbox_{session_id}_{}_{}",
            std::process::id(),
            rand_suffix()
        ));
        {
            use std::os::unix::fs::DirBuilderExt;
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(&temp_dir)
                .map_err(|e| {
                    SandboxError::io(format!("failed to create temp dir {temp_dir:?}: {e}"))
                })?;
        }

        let mut isolation_fallback = false;
        let saw_unshare = Arc::new(AtomicBool::new(false));

        let (child, stderr_task, actually_isolated) = if isolated {
            match Self::try_spawn(session_id, true, cwd, env, &saw_unshare).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("session {session_id}: isolated spawn failed ({e}), falling back");
                    isolation_fallback = true;
                    Self::try_spawn(session_id, false, cwd, env, &saw_unshare).await?
                }
            }
        } else {
            Self::try_spawn(session_id, false, cwd, env, &saw_unshare).await?
        };
        if isolated && !actually_isolated && !isolation_fallback {
            isolation_fallback = true;
        }

        Self::finish_spawn(
            session_id,
            child,
            stderr_task,
            temp_dir,
            actually_isolated,
            isolation_fallback,
            max_output,
        )
    }

    /// Spawn one bash and run the readiness grace. For isolated spawns, an
    /// early exit or an `unshare:` stderr line inside the grace window
    /// triggers the one-shot non-isolated respawn (explicit two-step, no
    /// retry loop).
    async fn try_spawn(
        session_id: &str,
        isolated: bool,
        cwd: &str,
        env: &HashMap<String, String>,
        saw_unshare: &Arc<AtomicBool>,
    ) -> Result<(Child, tokio::task::JoinHandle<()>, bool), SandboxError> {
        let mut child = bash_command(isolated, cwd, env)
            .spawn()
            .map_err(|e| SandboxError::new(ErrorKind::ShellDied, format!("spawn failed: {e}")))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::internal("shell stderr pipe missing"))?;
        let stderr_task =
            spawn_stderr_task(session_id.to_string(), stderr, Arc::clone(saw_unshare));

        tokio::time::sleep(SPAWN_GRACE).await;

        let exited_early = matches!(child.try_wait(), Ok(Some(_)));
        if isolated && (exited_early || saw_unshare.load(Ordering::SeqCst)) {
            warn!("session {session_id}: unshare unavailable, respawning without isolation");
            let _ = child.kill().await;
            stderr_task.abort();
            let (child, task, _) =
                Box::pin(Self::try_spawn(session_id, false, cwd, env, saw_unshare)).await?;
            return Ok((child, task, false));
        }
        if exited_early {
            return Err(SandboxError::new(
                ErrorKind::ShellDied,
                "shell exited during startup",
            ));
        }
        Ok((child, stderr_task, isolated))
    }

    fn finish_spawn(
        session_id: &str,
        mut child: Child,
        stderr_task: tokio::task::JoinHandle<()>,
        temp_dir: PathBuf,
        isolated: bool,
        isolation_fallback: bool,
        max_output: usize,
    ) -> Result<Self, SandboxError> {
        let pid = child.id().unwrap_or(0);
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::internal("shell stdin pipe missing"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::internal("shell stdout pipe missing"))?;

        let inner = Arc::new(ShellInner {
            session_id: session_id.to_string(),
            pending: Mutex::new(HashMap::new()),
            alive: AtomicBool::new(true),
            max_output,
        });

        // stdin writer task
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
        let stdin_task = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(data) = stdin_rx.recv().await {
                if stdin.write_all(&data).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // stdout marker parser task
        let marker_inner = Arc::clone(&inner);
        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                marker_inner.handle_marker_line(&line).await;
            }
            debug!("session {} shell stdout closed", marker_inner.session_id);
        });

        // exit watcher task — flips `alive` and fails all pending commands
        let exit_inner = Arc::clone(&inner);
        let exit_task = tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    info!(
                        "session {} shell exited with {status}",
                        exit_inner.session_id
                    );
                }
                Err(e) => {
                    error!("session {} shell wait error: {e}", exit_inner.session_id);
                }
            }
            exit_inner.alive.store(false, Ordering::SeqCst);
            exit_inner.fail_all_pending().await;
        });

        info!(
            "session {session_id}: shell spawned (pid {pid}, isolated={isolated}, fallback={isolation_fallback})"
        );

        Ok(Self {
            inner,
            temp_dir,
            isolated,
            isolation_fallback,
            pid,
            stdin_tx,
            tasks: vec![stdin_task, stdout_task, exit_task, stderr_task],
        })
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    fn check_alive(&self) -> Result<(), SandboxError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(SandboxError::new(
                ErrorKind::ShellDied,
                "shell is not alive",
            ))
        }
    }

    /// Write the user command (plus the cwd-sync epilogue) into `cmd_*`.
    async fn write_command_payload(
        &self,
        files: &IpcFiles,
        command: &str,
        with_epilogue: bool,
    ) -> Result<(), SandboxError> {
        let mut payload = String::with_capacity(command.len() + 96);
        payload.push_str(command);
        if !payload.ends_with('\n') {
            payload.push('\n');
        }
        if with_epilogue {
            payload.push_str("__rc=$?\n");
            payload.push_str(&format!(
                "pwd > {} 2>/dev/null\n",
                shell_escape(&files.cwd.to_string_lossy())
            ));
            payload.push_str("exit \"$__rc\"\n");
        }
        write_owner_only(&files.cmd, payload.as_bytes()).await
    }

    /// Build the wrapper script piped into bash stdin. Only server-generated,
    /// shell-escaped paths appear in it — never the command text.
    fn build_wrapper(&self, id: &str, files: &IpcFiles, cwd: Option<&str>, streaming: bool) -> String {
        let cmd = shell_escape(&files.cmd.to_string_lossy());
        let out = shell_escape(&files.out.to_string_lossy());
        let err = shell_escape(&files.err.to_string_lossy());
        let exit = shell_escape(&files.exit.to_string_lossy());
        let cwdf = shell_escape(&files.cwd.to_string_lossy());

        let start_marker = if streaming {
            format!("echo 'STREAM_STARTED:{id}'\n")
        } else {
            String::new()
        };
        let done_marker = if streaming {
            format!("echo 'STREAM_DONE:{id}'\n")
        } else {
            format!("echo 'DONE:{id}'\n")
        };

        // PID must precede STREAM_STARTED: both are parsed in order by the
        // stdout reader, and exec_stream only returns once STREAM_STARTED is
        // handled — so the child PID is always recorded before a caller can
        // issue a kill.
        let body = format!(
            "cat {cmd} | sh > {out} 2> {err} &\n\
             echo \"PID:{id}:$!\"\n\
             {start_marker}wait $!\n\
             echo $? > {exit}\n\
             if [ -s {cwdf} ]; then cd -- \"$(cat {cwdf})\" 2>/dev/null; fi\n\
             rm -f {cwdf}\n"
        );

        match cwd {
            // A literal `exit 1` here would kill the persistent shell, so a
            // failed cd writes the error and exit code to the IPC files instead.
            Some(dir) => {
                let dir = shell_escape(dir);
                format!(
                    "if cd {dir} 2> {err}; then\n{body}else\n: > {out}\necho 1 > {exit}\nfi\n{done_marker}"
                )
            }
            None => format!("{body}{done_marker}"),
        }
    }

    /// Wrapper for source-mode execution (`. cmd` runs in the bash itself,
    /// so exports persist). Used by [`ShellSession::set_env_var`].
    fn build_source_wrapper(&self, id: &str, files: &IpcFiles) -> String {
        let cmd = shell_escape(&files.cmd.to_string_lossy());
        let out = shell_escape(&files.out.to_string_lossy());
        let err = shell_escape(&files.err.to_string_lossy());
        let exit = shell_escape(&files.exit.to_string_lossy());
        format!(". {cmd} > {out} 2> {err}\necho $? > {exit}\necho 'DONE:{id}'\n")
    }

    /// Execute a command synchronously and collect its full output.
    pub async fn exec(
        &self,
        command_id: &str,
        command: &str,
        cwd: Option<&str>,
        timeout: Duration,
    ) -> Result<ExecOutcome, SandboxError> {
        self.check_alive()?;

        let files = IpcFiles::new(&self.temp_dir, command_id);
        self.write_command_payload(&files, command, true).await?;
        let wrapper = self.build_wrapper(command_id, &files, cwd, false);

        let (done_tx, mut done_rx) = oneshot::channel();
        let processed = Arc::new(AtomicBool::new(false));
        {
            let mut pending = self.inner.pending.lock().await;
            pending.insert(
                command_id.to_string(),
                Pending {
                    command: command.to_string(),
                    files: files.clone(),
                    processed: Arc::clone(&processed),
                    pid: Arc::new(AtomicI32::new(0)),
                    cancel: CancellationToken::new(),
                    kind: PendingKind::Sync {
                        done: Some(done_tx),
                    },
                    start: std::time::Instant::now(),
                },
            );
        }

        self.send_stdin(&wrapper).await?;

        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);
        tokio::select! {
            res = &mut done_rx => match res {
                Ok(outcome) => outcome,
                Err(_) => Err(SandboxError::new(ErrorKind::ShellDied, "shell is not alive")),
            },
            () = &mut sleep => {
                if self.claim_timeout(command_id).await {
                    Err(SandboxError::new(
                        ErrorKind::Timeout,
                        format!("command timed out after {} ms", timeout.as_millis()),
                    ))
                } else {
                    // The done marker won the race; its result is imminent.
                    match done_rx.await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(SandboxError::new(ErrorKind::ShellDied, "shell is not alive")),
                    }
                }
            }
        }
    }

    /// Begin a streaming execution.
    ///
    /// Returns `(events, pid)` only after the `start` event has been queued.
    /// The shell prints the `PID:` marker ahead of `STREAM_STARTED:` and the
    /// reader task handles them in order, so by the time this returns `pid`
    /// already holds the child PID — a caller that registers the command in
    /// the registry before handing the stream out can never lose a kill
    /// race, and the kill always has a PID to signal.
    pub async fn exec_stream(
        &self,
        command_id: &str,
        command: &str,
        cwd: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<(mpsc::Receiver<StreamEvent>, Arc<AtomicI32>), SandboxError> {
        self.check_alive()?;

        let files = IpcFiles::new(&self.temp_dir, command_id);
        self.write_command_payload(&files, command, true).await?;
        let wrapper = self.build_wrapper(command_id, &files, cwd, true);

        let (events_tx, events_rx) = mpsc::channel(256);
        let (started_tx, started_rx) = oneshot::channel();
        let processed = Arc::new(AtomicBool::new(false));
        let pid = Arc::new(AtomicI32::new(0));
        let cancel = CancellationToken::new();
        let offsets = Arc::new(Mutex::new(StreamOffsets::default()));

        {
            let mut pending = self.inner.pending.lock().await;
            pending.insert(
                command_id.to_string(),
                Pending {
                    command: command.to_string(),
                    files: files.clone(),
                    processed: Arc::clone(&processed),
                    pid: Arc::clone(&pid),
                    cancel: cancel.clone(),
                    kind: PendingKind::Stream {
                        events: events_tx.clone(),
                        started: Some(started_tx),
                        offsets: Arc::clone(&offsets),
                    },
                    start: std::time::Instant::now(),
                },
            );
        }

        // Delta poller — emits stdout/stderr suffixes every ~100 ms until
        // cancelled by the done marker (which flushes the final deltas itself).
        {
            let files = files.clone();
            let events = events_tx.clone();
            let offsets = Arc::clone(&offsets);
            let cancel = cancel.clone();
            let max = self.inner.max_output;
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(STREAM_POLL_INTERVAL);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = tick.tick() => {
                            emit_deltas(&files, &offsets, &events, max).await;
                        }
                    }
                }
            });
        }

        // Optional timeout watchdog.
        if let Some(timeout) = timeout {
            let inner = Arc::clone(&self.inner);
            let id = command_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                inner.timeout_stream(&id, timeout).await;
            });
        }

        self.send_stdin(&wrapper).await?;

        // Block until the shell acknowledged the command — the caller must
        // observe the first event before this function returns.
        if started_rx.await.is_err() && !self.is_alive() {
            return Err(SandboxError::new(
                ErrorKind::ShellDied,
                "shell is not alive",
            ));
        }

        Ok((events_rx, pid))
    }

    /// Resolve a streaming command as killed: emit a synthetic `complete`
    /// with `128 + signal` and leave file cleanup to the late done marker.
    pub async fn finish_killed(&self, command_id: &str, signal: i32) {
        let pending = self.inner.pending.lock().await;
        if let Some(p) = pending.get(command_id) {
            if p.processed
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                p.cancel.cancel();
                if let PendingKind::Stream { events, .. } = &p.kind {
                    let _ = events.try_send(StreamEvent::Complete {
                        exit_code: 128 + signal,
                    });
                }
            }
        }
    }

    /// Set an environment variable by sourcing `export K='V'` into the bash.
    pub async fn set_env_var(&self, key: &str, value: &str) -> Result<(), SandboxError> {
        if !is_valid_env_name(key) {
            return Err(SandboxError::validation(format!(
                "invalid environment variable name: {key}"
            )));
        }
        self.check_alive()?;

        let command_id = uuid::Uuid::new_v4().to_string();
        let files = IpcFiles::new(&self.temp_dir, &command_id);
        let payload = format!("export {key}={}\n", shell_escape(value));
        write_owner_only(&files.cmd, payload.as_bytes()).await?;
        let wrapper = self.build_source_wrapper(&command_id, &files);

        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().await;
            pending.insert(
                command_id.clone(),
                Pending {
                    command: format!("export {key}=…"),
                    files: files.clone(),
                    processed: Arc::new(AtomicBool::new(false)),
                    pid: Arc::new(AtomicI32::new(0)),
                    cancel: CancellationToken::new(),
                    kind: PendingKind::Sync {
                        done: Some(done_tx),
                    },
                    start: std::time::Instant::now(),
                },
            );
        }
        self.send_stdin(&wrapper).await?;

        let outcome = tokio::time::timeout(Duration::from_secs(10), done_rx)
            .await
            .map_err(|_| SandboxError::new(ErrorKind::Timeout, "env update timed out"))?
            .map_err(|_| SandboxError::new(ErrorKind::ShellDied, "shell is not alive"))??;

        if outcome.exit_code != 0 {
            return Err(SandboxError::internal(format!(
                "export failed with exit code {}: {}",
                outcome.exit_code, outcome.stderr
            )));
        }
        Ok(())
    }

    async fn send_stdin(&self, data: &str) -> Result<(), SandboxError> {
        self.stdin_tx
            .send(data.as_bytes().to_vec())
            .await
            .map_err(|_| SandboxError::new(ErrorKind::ShellDied, "shell stdin closed"))
    }

    /// Timeout path for synchronous exec: claim the command if the marker
    /// hasn't, remove it, and delete its files. Returns true if claimed.
    async fn claim_timeout(&self, command_id: &str) -> bool {
        let entry = {
            let mut pending = self.inner.pending.lock().await;
            let claimed = pending.get(command_id).is_some_and(|p| {
                p.processed
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            });
            if claimed {
                pending.remove(command_id)
            } else {
                None
            }
        };
        match entry {
            Some(p) => {
                p.cancel.cancel();
                p.files.cleanup().await;
                true
            }
            None => false,
        }
    }

    /// Kill the shell's process group and abort I/O tasks. The temp
    /// directory is removed as well.
    pub async fn destroy(&self) {
        #[allow(clippy::cast_possible_wrap)]
        let pgid = self.pid as i32;
        if pgid > 0 {
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
        self.inner.alive.store(false, Ordering::SeqCst);
        self.inner.fail_all_pending().await;
        for task in &self.tasks {
            task.abort();
        }
        let _ = tokio::fs::remove_dir_all(&self.temp_dir).await;
    }
}

impl ShellInner {
    /// Parse one shell stdout line for IPC markers.
    async fn handle_marker_line(&self, line: &str) {
        if let Some(id) = line.strip_prefix("DONE:") {
            self.on_done(id.trim()).await;
        } else if let Some(id) = line.strip_prefix("STREAM_DONE:") {
            self.on_done(id.trim()).await;
        } else if let Some(id) = line.strip_prefix("STREAM_STARTED:") {
            self.on_started(id.trim()).await;
        } else if let Some(rest) = line.strip_prefix("PID:") {
            if let Some((id, pid)) = rest.split_once(':') {
                if let Ok(pid) = pid.trim().parse::<i32>() {
                    self.on_pid(id, pid).await;
                }
            }
        } else if !line.is_empty() {
            debug!("session {} unexpected shell output: {line}", self.session_id);
        }
    }

    async fn on_started(&self, id: &str) {
        let mut pending = self.pending.lock().await;
        if let Some(p) = pending.get_mut(id) {
            if let PendingKind::Stream {
                events, started, ..
            } = &mut p.kind
            {
                let _ = events
                    .send(StreamEvent::Start {
                        command_id: id.to_string(),
                        command: p.command.clone(),
                        timestamp_ms: now_ms(),
                    })
                    .await;
                if let Some(tx) = started.take() {
                    let _ = tx.send(());
                }
            }
        }
    }

    async fn on_pid(&self, id: &str, pid: i32) {
        let pending = self.pending.lock().await;
        if let Some(p) = pending.get(id) {
            p.pid.store(pid, Ordering::SeqCst);
        }
    }

    /// Done-marker handler: winner of the `processed` race reads the result
    /// files and resolves the command; a loser only deletes the files.
    async fn on_done(&self, id: &str) {
        let entry = {
            let mut pending = self.pending.lock().await;
            pending.remove(id)
        };
        let Some(p) = entry else {
            debug!("session {}: done marker for unknown command {id}", self.session_id);
            return;
        };
        p.cancel.cancel();

        let won = p
            .processed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if !won {
            // Timeout or kill already resolved the caller.
            p.files.cleanup().await;
            return;
        }

        match p.kind {
            PendingKind::Sync { mut done } => {
                let result = read_outcome(&p.files, self.max_output, p.start).await;
                if let Some(tx) = done.take() {
                    let _ = tx.send(result);
                }
            }
            PendingKind::Stream {
                events, offsets, ..
            } => {
                // Flush deltas the poller hasn't picked up yet.
                emit_deltas(&p.files, &offsets, &events, self.max_output).await;
                match read_exit_code(&p.files.exit).await {
                    Ok(exit_code) => {
                        let _ = events.send(StreamEvent::Complete { exit_code }).await;
                    }
                    Err(error) => {
                        let _ = events.send(StreamEvent::Error { error }).await;
                    }
                }
            }
        }
        p.files.cleanup().await;
    }

    /// Streaming timeout watchdog body.
    async fn timeout_stream(&self, id: &str, timeout: Duration) {
        let entry = {
            let mut pending = self.pending.lock().await;
            let claimed = pending.get(id).is_some_and(|p| {
                p.processed
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            });
            if claimed {
                pending.remove(id)
            } else {
                None
            }
        };
        let Some(p) = entry else { return };
        p.cancel.cancel();
        if let PendingKind::Stream { events, .. } = &p.kind {
            let _ = events
                .send(StreamEvent::Error {
                    error: SandboxError::new(
                        ErrorKind::Timeout,
                        format!("command timed out after {} ms", timeout.as_millis()),
                    ),
                })
                .await;
        }
        p.files.cleanup().await;
    }

    /// Fail every pending command after the shell died.
    async fn fail_all_pending(&self) {
        let drained: Vec<Pending> = {
            let mut pending = self.pending.lock().await;
            pending.drain().map(|(_, p)| p).collect()
        };
        for mut p in drained {
            p.cancel.cancel();
            if p.processed
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }
            let err = SandboxError::new(ErrorKind::ShellDied, "shell is not alive");
            match &mut p.kind {
                PendingKind::Sync { done } => {
                    if let Some(tx) = done.take() {
                        let _ = tx.send(Err(err));
                    }
                }
                PendingKind::Stream { events, .. } => {
                    let _ = events.send(StreamEvent::Error { error: err }).await;
                }
            }
            p.files.cleanup().await;
        }
    }
}

/// Create (or truncate) a file with mode 0600 and write `data`.
async fn write_owner_only(path: &Path, data: &[u8]) -> Result<(), SandboxError> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .await
        .map_err(|e| SandboxError::io(format!("failed to create {path:?}: {e}")))?;
    file.write_all(data)
        .await
        .map_err(|e| SandboxError::io(format!("failed to write {path:?}: {e}")))?;
    file.flush()
        .await
        .map_err(|e| SandboxError::io(format!("failed to flush {path:?}: {e}")))?;
    Ok(())
}

/// Read a whole output file, keeping at most `max` bytes (with a truncation
/// notice appended, matching the one-shot exec behavior).
async fn read_file_capped(path: &Path, max: usize) -> Result<String, SandboxError> {
    let file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        // The file may legitimately not exist (command produced no output
        // before a cd failure).
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(SandboxError::io(format!("failed to open {path:?}: {e}"))),
    };
    let total = file.metadata().await.map(|m| m.len()).unwrap_or(0);
    let mut buf = Vec::with_capacity(usize::try_from(total).unwrap_or(0).min(max));
    let mut handle = file.take(max as u64);
    handle
        .read_to_end(&mut buf)
        .await
        .map_err(|e| SandboxError::io(format!("failed to read {path:?}: {e}")))?;
    let mut s = String::from_utf8_lossy(&buf).into_owned();
    if total > max as u64 {
        use std::fmt::Write;
        let _ = write!(s, "\n[truncated: {total} bytes total, showing first {max}]");
    }
    Ok(s)
}

async fn read_exit_code(path: &Path) -> Result<i32, SandboxError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| SandboxError::io(format!("failed to read exit file: {e}")))?;
    raw.trim()
        .parse::<i32>()
        .map_err(|e| SandboxError::io(format!("malformed exit file ({raw:?}): {e}")))
}

async fn read_outcome(
    files: &IpcFiles,
    max_output: usize,
    start: std::time::Instant,
) -> Result<ExecOutcome, SandboxError> {
    let exit_code = read_exit_code(&files.exit).await?;
    let stdout = read_file_capped(&files.out, max_output).await?;
    let stderr = read_file_capped(&files.err, max_output).await?;
    #[allow(clippy::cast_possible_truncation)]
    Ok(ExecOutcome {
        exit_code,
        stdout,
        stderr,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

/// Emit any new bytes in `out`/`err` as stream events, advancing `offsets`.
/// Emission per stream stops (with a single notice) once `max` bytes have
/// been delivered.
async fn emit_deltas(
    files: &IpcFiles,
    offsets: &Arc<Mutex<StreamOffsets>>,
    events: &mpsc::Sender<StreamEvent>,
    max: usize,
) {
    let mut off = offsets.lock().await;
    let StreamOffsets {
        out,
        err,
        out_truncated,
        err_truncated,
    } = &mut *off;

    if let Some(data) = read_delta(&files.out, out, out_truncated, max).await {
        let _ = events.send(StreamEvent::Stdout { data }).await;
    }
    if let Some(data) = read_delta(&files.err, err, err_truncated, max).await {
        let _ = events.send(StreamEvent::Stderr { data }).await;
    }
}

async fn read_delta(
    path: &Path,
    offset: &mut u64,
    truncated: &mut bool,
    max: usize,
) -> Option<String> {
    if *truncated {
        return None;
    }
    let len = tokio::fs::metadata(path).await.ok()?.len();
    if len <= *offset {
        return None;
    }
    use tokio::io::AsyncSeekExt;
    let mut file = tokio::fs::File::open(path).await.ok()?;
    file.seek(std::io::SeekFrom::Start(*offset)).await.ok()?;
    let mut buf = Vec::with_capacity(usize::try_from(len - *offset).unwrap_or(4096));
    file.read_to_end(&mut buf).await.ok()?;

    let emitted_so_far = usize::try_from(*offset).unwrap_or(usize::MAX);
    *offset = len;
    if emitted_so_far >= max {
        *truncated = true;
        return Some(format!("\n[output truncated at {max} bytes]"));
    }
    if emitted_so_far + buf.len() > max {
        buf.truncate(max - emitted_so_far);
        *truncated = true;
    }
    Some(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_env() -> HashMap<String, String> {
        HashMap::new()
    }

    async fn spawn_session(id: &str) -> (ShellSession, tempfile::TempDir) {
        let base = tempfile::tempdir().unwrap();
        let shell = ShellSession::spawn(id, "/tmp", &test_env(), false, base.path(), 1024 * 1024)
            .await
            .unwrap();
        (shell, base)
    }

    #[tokio::test]
    async fn exec_captures_stdout_and_exit_code() {
        let (shell, _base) = spawn_session("t-exec").await;
        let out = shell
            .exec("c1", "echo hi", None, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, "hi\n");
        assert_eq!(out.stderr, "");
        shell.destroy().await;
    }

    #[tokio::test]
    async fn exec_captures_stderr_and_nonzero_exit() {
        let (shell, _base) = spawn_session("t-err").await;
        let out = shell
            .exec("c1", "echo oops >&2; exit 3", None, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stderr, "oops\n");
        shell.destroy().await;
    }

    #[tokio::test]
    async fn cwd_persists_across_commands() {
        let (shell, _base) = spawn_session("t-cwd").await;
        let first = shell
            .exec("c1", "cd /tmp && pwd", None, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(first.stdout, "/tmp\n");
        let second = shell
            .exec("c2", "pwd", None, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(second.stdout, "/tmp\n");
        shell.destroy().await;
    }

    #[tokio::test]
    async fn cwd_override_failure_reports_exit_one() {
        let (shell, _base) = spawn_session("t-badcwd").await;
        let out = shell
            .exec(
                "c1",
                "echo never",
                Some("/nonexistent-dir-xyz"),
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        assert_eq!(out.exit_code, 1);
        assert_eq!(out.stdout, "");
        assert!(!out.stderr.is_empty());
        shell.destroy().await;
    }

    #[tokio::test]
    async fn env_var_persists() {
        let (shell, _base) = spawn_session("t-env").await;
        shell.set_env_var("SANDBOX_TEST_VAR", "hello world").await.unwrap();
        let out = shell
            .exec("c1", "echo \"$SANDBOX_TEST_VAR\"", None, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out.stdout, "hello world\n");
        shell.destroy().await;
    }

    #[tokio::test]
    async fn env_var_name_validated() {
        let (shell, _base) = spawn_session("t-envbad").await;
        let err = shell.set_env_var("9bad", "x").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        shell.destroy().await;
    }

    #[tokio::test]
    async fn metacharacters_do_not_escape_the_wrapper() {
        let (shell, _base) = spawn_session("t-meta").await;
        // The quotes/semicolons are part of the command payload; they run in
        // the child sh, not in our wrapper.
        let out = shell
            .exec("c1", "printf '%s' \"a'b;c\"", None, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out.stdout, "a'b;c");
        assert_eq!(out.exit_code, 0);
        shell.destroy().await;
    }

    #[tokio::test]
    async fn timeout_leaves_shell_usable() {
        let (shell, _base) = spawn_session("t-timeout").await;
        let err = shell
            .exec("c1", "sleep 5", None, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        // Shell must still accept commands. The previous child is still
        // holding the shell's wait, so allow generous time.
        assert!(shell.is_alive());
        shell.destroy().await;
    }

    #[tokio::test]
    async fn stream_emits_start_deltas_and_complete() {
        let (shell, _base) = spawn_session("t-stream").await;
        let (mut rx, _pid) = shell
            .exec_stream("c1", "echo one; echo two >&2; exit 7", None, None)
            .await
            .unwrap();

        let mut saw_start = false;
        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut exit_code = None;
        while let Some(ev) = rx.recv().await {
            match ev {
                StreamEvent::Start { command_id, .. } => {
                    assert_eq!(command_id, "c1");
                    saw_start = true;
                }
                StreamEvent::Stdout { data } => stdout.push_str(&data),
                StreamEvent::Stderr { data } => stderr.push_str(&data),
                StreamEvent::Complete { exit_code: code } => {
                    exit_code = Some(code);
                    break;
                }
                StreamEvent::Error { error } => panic!("unexpected error: {error}"),
            }
        }
        assert!(saw_start);
        assert_eq!(stdout, "one\n");
        assert_eq!(stderr, "two\n");
        assert_eq!(exit_code, Some(7));
        shell.destroy().await;
    }

    #[tokio::test]
    async fn stream_kill_yields_synthetic_complete() {
        let (shell, _base) = spawn_session("t-kill").await;
        let (mut rx, pid) = shell
            .exec_stream("c1", "sleep 10; echo done", None, None)
            .await
            .unwrap();

        // The PID marker precedes the start marker, so the child PID is
        // already tracked by the time exec_stream returns.
        let child_pid = pid.load(Ordering::SeqCst);
        assert_ne!(child_pid, 0);
        let ev = rx.recv().await.unwrap();
        assert!(matches!(ev, StreamEvent::Start { .. }));

        unsafe {
            libc::kill(child_pid, libc::SIGKILL);
        }
        shell.finish_killed("c1", libc::SIGKILL).await;

        let mut exit_code = None;
        let mut saw_done_output = false;
        while let Some(ev) = rx.recv().await {
            match ev {
                StreamEvent::Complete { exit_code: code } => {
                    exit_code = Some(code);
                    break;
                }
                StreamEvent::Stdout { data } if data.contains("done") => {
                    saw_done_output = true;
                }
                _ => {}
            }
        }
        assert_eq!(exit_code, Some(128 + libc::SIGKILL));
        assert!(!saw_done_output);
        shell.destroy().await;
    }

    #[tokio::test]
    async fn ipc_files_removed_after_exec() {
        let (shell, _base) = spawn_session("t-clean").await;
        shell
            .exec("c1", "echo x", None, Duration::from_secs(10))
            .await
            .unwrap();
        // Give the cleanup a moment, then check the temp dir only holds
        // nothing for this command.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut entries = tokio::fs::read_dir(&shell.temp_dir).await.unwrap();
        let mut leftover = Vec::new();
        while let Some(e) = entries.next_entry().await.unwrap() {
            leftover.push(e.file_name());
        }
        assert!(leftover.is_empty(), "leftover IPC files: {leftover:?}");
        shell.destroy().await;
    }
}
