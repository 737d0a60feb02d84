//! Pseudo-terminal lifecycle and output fan-out.
//!
//! Each [`Pty`] wraps a process spawned on the slave side of an `openpty`
//! pair: the child becomes a session leader with the slave as its
//! controlling terminal, stdin/stdout/stderr all `dup2`'d onto it. Output
//! read from the master is appended to a bounded replay ring (so a
//! reconnecting client can catch up) and fanned out to subscribers in
//! arrival order — the fan-out iterates a snapshot of the subscriber list,
//! never the live one.
//!
//! Writes and resizes against an exited PTY are rejected; `kill` on an
//! exited PTY is a no-op. A disconnect timer can reap PTYs nobody is
//! watching.

use std::collections::{HashMap, VecDeque};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nix::pty::{openpty, OpenptyResult, Winsize};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::config::PtyConfig;
use crate::error::{ErrorKind, SandboxError};
use crate::util::now_ms;

/// Bounded ring of the most recent output bytes (a contiguous suffix).
pub struct ByteRing {
    buf: VecDeque<u8>,
    cap: usize,
}

impl ByteRing {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap.min(4096)),
            cap,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        if data.len() >= self.cap {
            self.buf.clear();
            self.buf.extend(&data[data.len() - self.cap..]);
            return;
        }
        let overflow = (self.buf.len() + data.len()).saturating_sub(self.cap);
        if overflow > 0 {
            self.buf.drain(..overflow);
        }
        self.buf.extend(data);
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buf.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// PTY lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PtyState {
    Running,
    Exited,
}

/// Serializable PTY description.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PtyInfo {
    pub id: String,
    pub cols: u16,
    pub rows: u16,
    pub command: Vec<String>,
    pub cwd: String,
    pub created_at: u64,
    pub state: PtyState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub pid: u32,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Vec<u8>>,
}

/// One pseudo-terminal.
pub struct Pty {
    pub id: String,
    command: Vec<String>,
    cwd: String,
    created_at: u64,
    pid: u32,
    size: Mutex<(u16, u16)>,
    state: Mutex<(PtyState, Option<i32>)>,
    /// Master fd kept alive for resize; I/O runs on dup'd fds.
    master: OwnedFd,
    writer_tx: mpsc::Sender<Vec<u8>>,
    subscribers: Mutex<Vec<Subscriber>>,
    exit_listeners: Mutex<Vec<oneshot::Sender<Option<i32>>>>,
    replay: Mutex<ByteRing>,
    next_sub_id: AtomicU64,
    disconnect_timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

fn winsize(rows: u16, cols: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// Spawn `argv` on the slave side of the PTY. The child becomes a session
/// leader with the slave as its controlling terminal.
fn spawn_on_slave(
    slave: &OwnedFd,
    argv: &[String],
    cwd: &str,
    env: &HashMap<String, String>,
) -> std::io::Result<Child> {
    let slave_fd = slave.as_raw_fd();
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]).current_dir(cwd).kill_on_drop(true);

    // Stdio is wired up by pre_exec (dup2 onto the slave), so no pipes here.
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    let mut merged = env.clone();
    merged
        .entry("TERM".to_string())
        .or_insert_with(|| "xterm-256color".to_string());
    cmd.envs(&merged);

    // SAFETY: all syscalls used here are async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            libc::dup2(slave_fd, 0);
            libc::dup2(slave_fd, 1);
            libc::dup2(slave_fd, 2);
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            Ok(())
        });
    }
    cmd.spawn()
}

fn dup_to_file(fd: RawFd) -> std::io::Result<tokio::fs::File> {
    let duped = unsafe { libc::dup(fd) };
    if duped < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: we own `duped` via dup().
    Ok(tokio::fs::File::from_std(unsafe {
        std::fs::File::from_raw_fd(duped)
    }))
}

impl Pty {
    fn spawn(
        id: String,
        cols: u16,
        rows: u16,
        argv: Vec<String>,
        cwd: String,
        env: HashMap<String, String>,
        replay_cap: usize,
    ) -> Result<Arc<Self>, SandboxError> {
        let OpenptyResult { master, slave } = openpty(&winsize(rows, cols), None)
            .map_err(|e| SandboxError::io(format!("openpty failed: {e}")))?;

        let mut child = spawn_on_slave(&slave, &argv, &cwd, &env)
            .map_err(|e| SandboxError::io(format!("failed to spawn PTY process: {e}")))?;
        drop(slave);
        let pid = child.id().unwrap_or(0);

        let master_write = dup_to_file(master.as_raw_fd())
            .map_err(|e| SandboxError::io(format!("dup() for PTY writer failed: {e}")))?;
        let master_read = dup_to_file(master.as_raw_fd())
            .map_err(|e| SandboxError::io(format!("dup() for PTY reader failed: {e}")))?;

        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(64);

        let pty = Arc::new(Self {
            id: id.clone(),
            command: argv,
            cwd,
            created_at: now_ms(),
            pid,
            size: Mutex::new((cols, rows)),
            state: Mutex::new((PtyState::Running, None)),
            master,
            writer_tx,
            subscribers: Mutex::new(Vec::new()),
            exit_listeners: Mutex::new(Vec::new()),
            replay: Mutex::new(ByteRing::new(replay_cap)),
            next_sub_id: AtomicU64::new(1),
            disconnect_timer: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });

        // Writer task: mpsc → master.
        let writer_task = tokio::spawn(async move {
            let mut writer = master_write;
            while let Some(data) = writer_rx.recv().await {
                if writer.write_all(&data).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        // Reader task: master → replay ring + subscriber snapshot fan-out.
        let reader_pty = Arc::clone(&pty);
        let reader_task = tokio::spawn(async move {
            let mut reader = master_read;
            let mut tmp = [0u8; 4096];
            loop {
                match reader.read(&mut tmp).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let chunk = tmp[..n].to_vec();
                        reader_pty.replay.lock().await.push(&chunk);
                        // Snapshot under the lock, send outside it.
                        let targets: Vec<(u64, mpsc::Sender<Vec<u8>>)> = {
                            let subs = reader_pty.subscribers.lock().await;
                            subs.iter().map(|s| (s.id, s.tx.clone())).collect()
                        };
                        let mut dead = Vec::new();
                        for (sub_id, tx) in targets {
                            if tx.send(chunk.clone()).await.is_err() {
                                dead.push(sub_id);
                            }
                        }
                        if !dead.is_empty() {
                            let mut subs = reader_pty.subscribers.lock().await;
                            subs.retain(|s| !dead.contains(&s.id));
                        }
                    }
                }
            }
            debug!("pty {} output closed", reader_pty.id);
        });

        // Exit watcher.
        let exit_pty = Arc::clone(&pty);
        let exit_task = tokio::spawn(async move {
            let exit_code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("pty {} wait error: {e}", exit_pty.id);
                    None
                }
            };
            info!("pty {} exited (code {exit_code:?})", exit_pty.id);
            *exit_pty.state.lock().await = (PtyState::Exited, exit_code);
            for tx in exit_pty.exit_listeners.lock().await.drain(..) {
                let _ = tx.send(exit_code);
            }
            // Release data subscribers: their channels close, ending streams.
            exit_pty.subscribers.lock().await.clear();
        });

        pty.tasks
            .try_lock()
            .expect("fresh mutex")
            .extend([writer_task, reader_task, exit_task]);

        Ok(pty)
    }

    pub async fn info(&self) -> PtyInfo {
        let (cols, rows) = *self.size.lock().await;
        let (state, exit_code) = *self.state.lock().await;
        PtyInfo {
            id: self.id.clone(),
            cols,
            rows,
            command: self.command.clone(),
            cwd: self.cwd.clone(),
            created_at: self.created_at,
            state,
            exit_code,
            pid: self.pid,
        }
    }

    pub async fn is_exited(&self) -> bool {
        self.state.lock().await.0 == PtyState::Exited
    }

    /// Write raw bytes to the terminal. Rejected once the PTY has exited.
    pub async fn write(&self, data: Vec<u8>) -> Result<(), SandboxError> {
        if self.is_exited().await {
            return Err(SandboxError::new(
                ErrorKind::Precondition,
                format!("pty {} has exited", self.id),
            ));
        }
        self.writer_tx
            .send(data)
            .await
            .map_err(|_| SandboxError::new(ErrorKind::Precondition, "pty writer closed"))
    }

    /// Resize the terminal window. Rejected once the PTY has exited.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SandboxError> {
        if self.is_exited().await {
            return Err(SandboxError::new(
                ErrorKind::Precondition,
                format!("pty {} has exited", self.id),
            ));
        }
        let ws = winsize(rows, cols);
        // SAFETY: TIOCSWINSZ writes a Winsize struct through the pointer.
        let ret = unsafe {
            libc::ioctl(
                self.master.as_raw_fd(),
                libc::TIOCSWINSZ,
                std::ptr::addr_of!(ws),
            )
        };
        if ret == -1 {
            return Err(SandboxError::io(format!(
                "resize failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        *self.size.lock().await = (cols, rows);
        Ok(())
    }

    /// Signal the PTY's process tree. `"SIGKILL"` maps to 9, anything else
    /// to 15. No-op (idempotent) on an exited PTY.
    pub async fn kill(&self, signal: Option<&str>) {
        if self.is_exited().await {
            return;
        }
        let sig = match signal {
            Some("SIGKILL") => libc::SIGKILL,
            _ => libc::SIGTERM,
        };
        #[allow(clippy::cast_possible_wrap)]
        let pid = self.pid as i32;
        if pid > 0 {
            // The child is a session leader; signal the whole group.
            unsafe {
                libc::kill(-pid, sig);
            }
        }
    }

    /// Subscribe to output. Returns the replay buffer contents, the data
    /// receiver, and the subscriber id (dropping the receiver — or calling
    /// [`Pty::unsubscribe`] — detaches it). A subscriber added after exit
    /// gets the replay and an already-closed channel.
    pub async fn subscribe(&self) -> (Vec<u8>, mpsc::Receiver<Vec<u8>>, u64) {
        let replay = self.replay.lock().await.contents();
        let (tx, rx) = mpsc::channel(256);
        let id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);
        if !self.is_exited().await {
            self.subscribers.lock().await.push(Subscriber { id, tx });
        }
        (replay, rx, id)
    }

    pub async fn unsubscribe(&self, sub_id: u64) {
        self.subscribers.lock().await.retain(|s| s.id != sub_id);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    /// Register an exit listener. Fires immediately when already exited.
    pub async fn on_exit(&self) -> oneshot::Receiver<Option<i32>> {
        let (tx, rx) = oneshot::channel();
        let (state, code) = *self.state.lock().await;
        if state == PtyState::Exited {
            let _ = tx.send(code);
        } else {
            self.exit_listeners.lock().await.push(tx);
        }
        rx
    }

    async fn abort_tasks(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Some(timer) = self.disconnect_timer.lock().await.take() {
            timer.abort();
        }
    }
}

/// Owner of all PTYs.
#[derive(Clone)]
pub struct PtyManager {
    ptys: Arc<tokio::sync::RwLock<HashMap<String, Arc<Pty>>>>,
    config: PtyConfig,
}

impl PtyManager {
    pub fn new(config: PtyConfig) -> Self {
        Self {
            ptys: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Create a PTY. Defaults: `["bash"]`, the manager's configured size.
    pub async fn create(
        &self,
        cols: Option<u16>,
        rows: Option<u16>,
        command: Option<Vec<String>>,
        cwd: Option<&str>,
        env: Option<HashMap<String, String>>,
    ) -> Result<PtyInfo, SandboxError> {
        let cols = cols.unwrap_or(self.config.default_cols);
        let rows = rows.unwrap_or(self.config.default_rows);
        if cols == 0 || rows == 0 {
            return Err(SandboxError::validation("cols and rows must be non-zero"));
        }
        let argv = match command {
            Some(v) if !v.is_empty() => v,
            _ => vec!["bash".to_string()],
        };
        let cwd = cwd.unwrap_or("/").to_string();

        let id = uuid::Uuid::new_v4().to_string();
        let pty = Pty::spawn(
            id.clone(),
            cols,
            rows,
            argv,
            cwd,
            env.unwrap_or_default(),
            self.config.replay_buffer_bytes,
        )?;
        let info = pty.info().await;
        self.ptys.write().await.insert(id.clone(), pty);
        info!("pty {id} created ({cols}x{rows})");
        Ok(info)
    }

    pub async fn get(&self, id: &str) -> Result<Arc<Pty>, SandboxError> {
        self.ptys
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SandboxError::not_found(format!("pty {id} not found")))
    }

    pub async fn list(&self) -> Vec<PtyInfo> {
        let ptys: Vec<Arc<Pty>> = self.ptys.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(ptys.len());
        for pty in ptys {
            infos.push(pty.info().await);
        }
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    /// Kill and remove a PTY.
    pub async fn remove(&self, id: &str, signal: Option<&str>) -> Result<(), SandboxError> {
        let pty = {
            let mut ptys = self.ptys.write().await;
            ptys.remove(id)
        }
        .ok_or_else(|| SandboxError::not_found(format!("pty {id} not found")))?;
        pty.kill(signal.or(Some("SIGKILL"))).await;
        pty.abort_tasks().await;
        info!("pty {id} removed");
        Ok(())
    }

    /// Arm the disconnect timer: the PTY is killed if no subscriber shows up
    /// within the configured window. Disabled when the window is 0.
    pub async fn start_disconnect_timer(&self, id: &str) {
        let window = self.config.disconnect_timeout_ms;
        if window == 0 {
            return;
        }
        let Ok(pty) = self.get(id).await else { return };
        let manager = self.clone();
        let pty_id = id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(window)).await;
            let Ok(pty) = manager.get(&pty_id).await else {
                return;
            };
            if pty.subscriber_count().await == 0 {
                info!("pty {pty_id}: no client reconnected, reaping");
                let _ = manager.remove(&pty_id, Some("SIGKILL")).await;
            }
        });
        let mut slot = pty.disconnect_timer.lock().await;
        if let Some(old) = slot.replace(timer) {
            old.abort();
        }
    }

    pub async fn cancel_disconnect_timer(&self, id: &str) {
        if let Ok(pty) = self.get(id).await {
            if let Some(timer) = pty.disconnect_timer.lock().await.take() {
                timer.abort();
            }
        }
    }

    /// Kill every PTY (container shutdown).
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<Pty>> = {
            let mut ptys = self.ptys.write().await;
            ptys.drain().map(|(_, p)| p).collect()
        };
        for pty in drained {
            pty.kill(Some("SIGKILL")).await;
            pty.abort_tasks().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn byte_ring_keeps_suffix() {
        let mut ring = ByteRing::new(8);
        ring.push(b"abcd");
        assert_eq!(ring.contents(), b"abcd");
        ring.push(b"efgh");
        assert_eq!(ring.contents(), b"abcdefgh");
        ring.push(b"ij");
        assert_eq!(ring.contents(), b"cdefghij");
        // A push larger than the capacity keeps only its own tail.
        ring.push(b"0123456789abcdef");
        assert_eq!(ring.contents(), b"89abcdef");
    }

    fn manager() -> PtyManager {
        PtyManager::new(PtyConfig {
            // No background reaping during tests.
            disconnect_timeout_ms: 0,
            ..PtyConfig::default()
        })
    }

    async fn read_until(
        rx: &mut mpsc::Receiver<Vec<u8>>,
        needle: &[u8],
        mut acc: Vec<u8>,
    ) -> Vec<u8> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !acc
            .windows(needle.len().max(1))
            .any(|w| w == needle)
        {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(chunk)) => acc.extend(chunk),
                _ => break,
            }
        }
        acc
    }

    #[tokio::test]
    async fn write_and_replay() {
        let mgr = manager();
        let info = mgr
            .create(Some(80), Some(24), Some(vec!["sh".into()]), Some("/tmp"), None)
            .await
            .unwrap();
        assert_eq!(info.cols, 80);
        assert_eq!(info.rows, 24);

        let pty = mgr.get(&info.id).await.unwrap();
        let (replay, mut rx, _sub) = pty.subscribe().await;
        pty.write(b"echo hello\n".to_vec()).await.unwrap();

        let acc = read_until(&mut rx, b"hello", replay).await;
        let text = String::from_utf8_lossy(&acc).into_owned();
        assert!(text.contains("hello"), "pty output: {text:?}");
        drop(rx);

        // A fresh subscriber sees the replayed suffix, including the echoed
        // input.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let (replay, _rx2, _sub2) = pty.subscribe().await;
        let replayed = String::from_utf8_lossy(&replay).into_owned();
        assert!(replayed.contains("echo hello"), "replay: {replayed:?}");

        mgr.remove(&info.id, None).await.unwrap();
    }

    #[tokio::test]
    async fn resize_updates_size() {
        let mgr = manager();
        let info = mgr
            .create(None, None, Some(vec!["sh".into()]), Some("/tmp"), None)
            .await
            .unwrap();
        let pty = mgr.get(&info.id).await.unwrap();
        pty.resize(120, 40).await.unwrap();
        let info = pty.info().await;
        assert_eq!((info.cols, info.rows), (120, 40));
        mgr.remove(&pty.id, None).await.unwrap();
    }

    #[tokio::test]
    async fn write_after_exit_is_rejected_and_kill_is_idempotent() {
        let mgr = manager();
        let info = mgr
            .create(None, None, Some(vec!["sh".into(), "-c".into(), "exit 0".into()]), Some("/tmp"), None)
            .await
            .unwrap();
        let pty = mgr.get(&info.id).await.unwrap();

        // Exit listener resolves even when registered around process exit.
        let exit = pty.on_exit().await;
        let code = tokio::time::timeout(Duration::from_secs(10), exit)
            .await
            .expect("exit within deadline")
            .unwrap();
        assert_eq!(code, Some(0));

        let err = pty.write(b"x".to_vec()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Precondition);
        let err = pty.resize(10, 10).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Precondition);

        // Idempotent on an exited PTY.
        pty.kill(Some("SIGKILL")).await;
        pty.kill(None).await;

        // Exit listener added after exit fires immediately.
        let code = pty.on_exit().await.await.unwrap();
        assert_eq!(code, Some(0));

        mgr.remove(&pty.id, None).await.unwrap();
        assert!(mgr.get(&pty.id).await.is_err());
    }

    #[tokio::test]
    async fn unknown_pty_is_not_found() {
        let mgr = manager();
        assert!(mgr.get("nope").await.is_err());
        assert!(mgr.remove("nope", None).await.is_err());
    }
}
