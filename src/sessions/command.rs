//! Command tracking and cancellation.
//!
//! Every streaming (and background) command is registered here *before* its
//! start is acknowledged to the caller — that ordering is what makes an
//! immediate `kill` after dispatch land on the registry entry instead of
//! racing past it. A kill resolves through the PID the shell reported via
//! the `PID:<id>:<pid>` marker, which the shell prints ahead of the start
//! marker so tracked commands always carry a real PID.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::SandboxError;

/// Cancellation handle for one in-flight command.
#[derive(Clone)]
pub struct CommandHandle {
    pub session_id: String,
    pub command_id: String,
    /// PID of the wrapped child; 0 until the shell reports it.
    pub pid: Arc<AtomicI32>,
}

/// Mapping `(session_id, command_id) → CommandHandle`.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    inner: Arc<Mutex<HashMap<(String, String), CommandHandle>>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command. Must happen before the caller learns the command
    /// started.
    pub async fn track(&self, session_id: &str, command_id: &str, pid: Arc<AtomicI32>) {
        let mut inner = self.inner.lock().await;
        inner.insert(
            (session_id.to_string(), command_id.to_string()),
            CommandHandle {
                session_id: session_id.to_string(),
                command_id: command_id.to_string(),
                pid,
            },
        );
    }

    /// Remove a command once it reaches a terminal state.
    pub async fn untrack(&self, session_id: &str, command_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.remove(&(session_id.to_string(), command_id.to_string()));
    }

    /// Whether a command is currently tracked.
    pub async fn is_tracked(&self, session_id: &str, command_id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.contains_key(&(session_id.to_string(), command_id.to_string()))
    }

    /// Find which session a command id belongs to (kill endpoints receive
    /// only the command id).
    pub async fn session_for(&self, command_id: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .keys()
            .find(|(_, cid)| cid == command_id)
            .map(|(sid, _)| sid.clone())
    }

    /// Kill a tracked command by signalling its child PID.
    ///
    /// Unknown (or already-completed) commands report `COMMAND_NOT_FOUND`.
    /// Returns the signal that was sent so the caller can synthesize the
    /// terminal event.
    pub async fn kill(
        &self,
        session_id: &str,
        command_id: &str,
        signal: i32,
    ) -> Result<i32, SandboxError> {
        let handle = {
            let mut inner = self.inner.lock().await;
            inner.remove(&(session_id.to_string(), command_id.to_string()))
        };
        let Some(handle) = handle else {
            return Err(SandboxError::not_found(format!(
                "command {command_id} not found in session {session_id}"
            )));
        };

        let pid = handle.pid.load(Ordering::SeqCst);
        if pid > 0 {
            let ret = unsafe { libc::kill(pid, signal) };
            if ret != 0 {
                let errno = std::io::Error::last_os_error();
                // ESRCH means the child finished between lookup and kill;
                // the synthetic complete is still the right answer.
                debug!("kill({pid}, {signal}) for {command_id}: {errno}");
            }
        } else {
            // The shell reports the PID before the start marker, and commands
            // are only tracked after the start marker is parsed — a zero here
            // means the command failed before its child ever spawned (e.g. a
            // bad cwd override), so there is nothing left to signal.
            debug!("command {command_id}: no child PID recorded, nothing to signal");
        }
        Ok(signal)
    }

    /// Kill every tracked command (used by kill-all). Returns the count.
    pub async fn kill_all(&self, signal: i32) -> Vec<CommandHandle> {
        let drained: Vec<CommandHandle> = {
            let mut inner = self.inner.lock().await;
            inner.drain().map(|(_, h)| h).collect()
        };
        for handle in &drained {
            let pid = handle.pid.load(Ordering::SeqCst);
            if pid > 0 {
                unsafe {
                    libc::kill(pid, signal);
                }
            } else {
                // Zero only for commands that failed before their child
                // spawned; nothing to signal.
                debug!(
                    "command {}: no child PID recorded, nothing to signal",
                    handle.command_id
                );
            }
        }
        drained
    }

    pub async fn count(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// Map an optional signal name to its number (`"SIGKILL"` → 9, else 15).
pub fn signal_from_name(name: Option<&str>) -> i32 {
    match name {
        Some("SIGKILL") => libc::SIGKILL,
        _ => libc::SIGTERM,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn kill_unknown_command_is_not_found() {
        let reg = CommandRegistry::new();
        let err = reg.kill("s1", "nope", libc::SIGTERM).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn kill_without_recorded_pid_still_resolves() {
        let reg = CommandRegistry::new();
        // A zero PID models a command that failed before its child spawned.
        let pid = Arc::new(AtomicI32::new(0));
        reg.track("s1", "c1", Arc::clone(&pid)).await;
        assert!(reg.is_tracked("s1", "c1").await);
        let sig = reg.kill("s1", "c1", libc::SIGTERM).await.unwrap();
        assert_eq!(sig, libc::SIGTERM);
        // Second kill: the entry is gone.
        assert!(reg.kill("s1", "c1", libc::SIGTERM).await.is_err());
    }

    #[tokio::test]
    async fn untrack_removes_entry() {
        let reg = CommandRegistry::new();
        reg.track("s1", "c1", Arc::new(AtomicI32::new(0))).await;
        reg.untrack("s1", "c1").await;
        assert!(!reg.is_tracked("s1", "c1").await);
        assert_eq!(reg.count().await, 0);
    }

    #[test]
    fn signal_names() {
        assert_eq!(signal_from_name(Some("SIGKILL")), libc::SIGKILL);
        assert_eq!(signal_from_name(Some("SIGTERM")), libc::SIGTERM);
        assert_eq!(signal_from_name(None), libc::SIGTERM);
    }
}
