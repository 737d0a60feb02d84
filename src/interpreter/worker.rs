//! One long-running interpreter child process.
//!
//! A worker is spawned from the embedded worker program for its language,
//! reports `{"status":"ready"}` on stdout when initialized, and then serves
//! one request per line. Executions on a worker are serialized by the pool's
//! per-worker mutex; the worker itself only assumes one request is in flight
//! at a time.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::{ErrorKind, SandboxError};
use crate::util::now_ms;

use super::{Language, WorkerRequest, WorkerResponse};

/// Extra slack the server grants beyond the in-worker execution timeout
/// before declaring the worker unresponsive.
const RESPONSE_GRACE: Duration = Duration::from_secs(5);

/// A spawned interpreter child with its protocol plumbing.
#[derive(Debug)]
pub struct InterpreterWorker {
    pub id: String,
    pub language: Language,
    pub pid: u32,
    stdin_tx: mpsc::Sender<String>,
    responses: Mutex<mpsc::Receiver<WorkerResponse>>,
    alive: Arc<AtomicBool>,
    /// Unix ms of the last completed execution (idle-eviction input).
    last_used: AtomicU64,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl InterpreterWorker {
    /// Spawn a worker and wait for its ready handshake.
    ///
    /// `exit_tx` receives `(language, worker_id)` when the child exits for
    /// any reason, feeding the pool's shared cleanup path.
    pub async fn spawn(
        language: Language,
        script_path: &Path,
        cwd: &str,
        spawn_timeout: Duration,
        exit_tx: mpsc::UnboundedSender<(Language, String)>,
    ) -> Result<Self, SandboxError> {
        let id = uuid::Uuid::new_v4().to_string();

        let mut cmd = match language {
            Language::Python => {
                let mut c = Command::new("python3");
                c.arg("-u").arg(script_path);
                c
            }
            Language::Javascript => {
                let mut c = Command::new("node");
                c.arg(script_path);
                c
            }
            Language::Typescript => {
                let mut c = Command::new("node");
                c.arg(script_path).arg("--typescript");
                c
            }
        };
        let mut child = cmd
            .current_dir(cwd)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SandboxError::new(
                    ErrorKind::WorkerDied,
                    format!("failed to spawn {language} worker: {e}"),
                )
            })?;

        let pid = child.id().unwrap_or(0);
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::internal("worker stdin pipe missing"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::internal("worker stdout pipe missing"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::internal("worker stderr pipe missing"))?;

        let alive = Arc::new(AtomicBool::new(true));

        // stdin writer task
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(16);
        let stdin_task = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = stdin_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // stdout reader task: first the ready line, then responses
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let (resp_tx, resp_rx) = mpsc::channel::<WorkerResponse>(16);
        let reader_id = id.clone();
        let stdout_task = tokio::spawn(async move {
            let mut ready_tx = Some(ready_tx);
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if ready_tx.is_some() {
                    if let Ok(v) = serde_json::from_str::<serde_json::Value>(&line) {
                        if v["status"] == "ready" {
                            if let Some(tx) = ready_tx.take() {
                                let _ = tx.send(());
                            }
                            continue;
                        }
                    }
                }
                match serde_json::from_str::<WorkerResponse>(&line) {
                    Ok(resp) => {
                        if resp_tx.send(resp).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => debug!("worker {reader_id}: non-protocol stdout: {line}"),
                }
            }
        });

        // stderr logger task
        let stderr_id = id.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("worker {stderr_id} stderr: {line}");
            }
        });

        // exit watcher — feeds the pool's shared cleanup path
        let exit_id = id.clone();
        let exit_alive = Arc::clone(&alive);
        let exit_task = tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!("worker {exit_id} ({language}) exited with {status}"),
                Err(e) => error!("worker {exit_id} wait error: {e}"),
            }
            exit_alive.store(false, Ordering::SeqCst);
            let _ = exit_tx.send((language, exit_id));
        });

        let worker = Self {
            id,
            language,
            pid,
            stdin_tx,
            responses: Mutex::new(resp_rx),
            alive,
            last_used: AtomicU64::new(now_ms()),
            tasks: vec![stdin_task, stdout_task, stderr_task, exit_task],
        };

        match tokio::time::timeout(spawn_timeout, ready_rx).await {
            Ok(Ok(())) => {
                info!("worker {} ({language}) ready (pid {})", worker.id, pid);
                Ok(worker)
            }
            Ok(Err(_)) | Err(_) => {
                warn!("worker {} ({language}) failed ready handshake", worker.id);
                worker.kill();
                Err(SandboxError::new(
                    ErrorKind::WorkerDied,
                    format!("{language} worker did not become ready"),
                ))
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn last_used_ms(&self) -> u64 {
        self.last_used.load(Ordering::SeqCst)
    }

    /// Run one code cell. The caller must hold this worker's execution mutex;
    /// the protocol is strictly one request, one response.
    pub async fn execute(
        &self,
        code: &str,
        timeout_ms: Option<u64>,
    ) -> Result<WorkerResponse, SandboxError> {
        if !self.is_alive() {
            return Err(SandboxError::new(
                ErrorKind::WorkerDied,
                format!("{} worker {} is not alive", self.language, self.id),
            ));
        }

        let execution_id = uuid::Uuid::new_v4().to_string();
        let request = WorkerRequest {
            code,
            execution_id: &execution_id,
            timeout: timeout_ms,
        };
        let mut line = serde_json::to_string(&request)
            .map_err(|e| SandboxError::internal(format!("request serialization failed: {e}")))?;
        line.push('\n');
        self.stdin_tx.send(line).await.map_err(|_| {
            SandboxError::new(ErrorKind::WorkerDied, "worker stdin closed")
        })?;

        let deadline = timeout_ms.map_or(RESPONSE_GRACE * 12, |t| {
            Duration::from_millis(t) + RESPONSE_GRACE
        });
        let mut responses = self.responses.lock().await;
        loop {
            let resp = tokio::time::timeout(deadline, responses.recv())
                .await
                .map_err(|_| {
                    SandboxError::new(ErrorKind::Timeout, "worker did not respond in time")
                })?
                .ok_or_else(|| {
                    SandboxError::new(ErrorKind::WorkerDied, "worker stream closed")
                })?;
            if resp.execution_id == execution_id || resp.execution_id.is_empty() {
                self.last_used.store(now_ms(), Ordering::SeqCst);
                return Ok(resp);
            }
            // A stale response from an earlier timed-out execution; drop it.
            debug!(
                "worker {}: discarding stale response for {}",
                self.id, resp.execution_id
            );
        }
    }

    /// Kill the child and abort the I/O tasks. Idempotent.
    pub fn kill(&self) {
        #[allow(clippy::cast_possible_wrap)]
        let pid = self.pid as i32;
        if pid > 0 && self.is_alive() {
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}
