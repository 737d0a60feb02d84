//! Process record store: live records in memory, terminal records on disk.
//!
//! Background commands (and any streaming command started through
//! `/api/process/start`) get a [`ProcessRecord`]. While the process runs the
//! record lives in a map and carries a broadcast channel for log streaming;
//! when it reaches a terminal status the record is serialized to
//! `<dir>/<id>.json` and evicted from memory. Persistence failure is logged
//! but the eviction proceeds — bounded memory wins over complete history.
//! Terminal records are immutable: later updates are ignored.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info};

use crate::error::SandboxError;
use crate::util::now_ms;

/// Default on-disk location for terminal records.
pub const DEFAULT_PROCESS_DIR: &str = "/tmp/sandbox-internal/processes";

/// Lifecycle status of a tracked process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Starting,
    Running,
    Completed,
    Failed,
    Killed,
    Error,
}

impl ProcessStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Killed | Self::Error
        )
    }

    /// Map an exit outcome to the terminal status (`0 → completed`,
    /// non-zero → failed; kills and IPC errors are set explicitly).
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            Self::Completed
        } else {
            Self::Failed
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Killed => "killed",
            Self::Error => "error",
        }
    }
}

/// Output event fanned out to `/api/process/{id}/stream` subscribers.
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    Stdout(String),
    Stderr(String),
    Status(ProcessStatus),
    Exit { exit_code: Option<i32> },
}

/// Server-side metadata for one command. Serialized to disk on termination;
/// the broadcast channel is dropped in that transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    pub session_id: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub status: ProcessStatus,
    pub start_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl ProcessRecord {
    pub fn new(id: &str, session_id: &str, command: &str, cwd: Option<String>) -> Self {
        Self {
            id: id.to_string(),
            pid: None,
            session_id: session_id.to_string(),
            command: command.to_string(),
            cwd,
            status: ProcessStatus::Starting,
            start_time: now_ms(),
            end_time: None,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// Partial update applied by [`ProcessStore::update`].
#[derive(Debug, Default, Clone)]
pub struct ProcessPatch {
    pub pid: Option<i32>,
    pub status: Option<ProcessStatus>,
    pub exit_code: Option<i32>,
    pub append_stdout: Option<String>,
    pub append_stderr: Option<String>,
}

struct LiveRecord {
    record: ProcessRecord,
    events: broadcast::Sender<ProcessEvent>,
}

/// Filter for [`ProcessStore::list`].
#[derive(Debug, Default, Clone)]
pub struct ProcessFilter {
    pub status: Option<ProcessStatus>,
    pub session_id: Option<String>,
}

/// Two-tier record store.
#[derive(Clone)]
pub struct ProcessStore {
    live: Arc<RwLock<HashMap<String, LiveRecord>>>,
    dir: PathBuf,
    max_output: usize,
}

impl ProcessStore {
    pub fn new(dir: impl Into<PathBuf>, max_output: usize) -> Self {
        let dir = dir.into();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            error!("failed to create process record dir {dir:?}: {e}");
        }
        Self {
            live: Arc::new(RwLock::new(HashMap::new())),
            dir,
            max_output,
        }
    }

    /// Insert a new live record and return its event channel.
    pub async fn create(&self, record: ProcessRecord) -> broadcast::Sender<ProcessEvent> {
        let (events, _) = broadcast::channel(256);
        let id = record.id.clone();
        let mut live = self.live.write().await;
        live.insert(
            id,
            LiveRecord {
                record,
                events: events.clone(),
            },
        );
        events
    }

    /// Merge a patch into a live record. When the patch makes the status
    /// terminal the record is written to disk and evicted from memory.
    /// Updates against terminal (on-disk) records are ignored.
    pub async fn update(&self, id: &str, patch: ProcessPatch) {
        let persisted = {
            let mut live = self.live.write().await;
            let Some(entry) = live.get_mut(id) else {
                // Already terminal (or unknown): terminal records never mutate.
                debug!("update for non-live process {id} ignored");
                return;
            };
            if let Some(pid) = patch.pid {
                entry.record.pid = Some(pid);
            }
            if let Some(data) = patch.append_stdout {
                append_capped(&mut entry.record.stdout, &data, self.max_output);
                let _ = entry.events.send(ProcessEvent::Stdout(data));
            }
            if let Some(data) = patch.append_stderr {
                append_capped(&mut entry.record.stderr, &data, self.max_output);
                let _ = entry.events.send(ProcessEvent::Stderr(data));
            }
            if let Some(code) = patch.exit_code {
                entry.record.exit_code = Some(code);
            }
            if let Some(status) = patch.status {
                entry.record.status = status;
                let _ = entry.events.send(ProcessEvent::Status(status));
                if status.is_terminal() {
                    entry.record.end_time = Some(now_ms());
                    let _ = entry.events.send(ProcessEvent::Exit {
                        exit_code: entry.record.exit_code,
                    });
                    let entry = live.remove(id).expect("entry present");
                    Some(entry.record)
                } else {
                    None
                }
            } else {
                None
            }
        };

        if let Some(record) = persisted {
            self.persist(&record).await;
        }
    }

    /// Write a terminal record to disk. Failure is logged; the in-memory
    /// eviction already happened (bounded memory over complete history).
    async fn persist(&self, record: &ProcessRecord) {
        let path = self.path_for(&record.id);
        match serde_json::to_vec_pretty(record) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&path, bytes).await {
                    error!("failed to persist process record {path:?}: {e}");
                } else {
                    info!(
                        "process {} persisted ({})",
                        record.id,
                        record.status.as_str()
                    );
                }
            }
            Err(e) => error!("failed to serialize process record {}: {e}", record.id),
        }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Fetch a record: memory first, then disk.
    pub async fn get(&self, id: &str) -> Option<ProcessRecord> {
        {
            let live = self.live.read().await;
            if let Some(entry) = live.get(id) {
                return Some(entry.record.clone());
            }
        }
        self.load_from_disk(id).await
    }

    async fn load_from_disk(&self, id: &str) -> Option<ProcessRecord> {
        let path = self.path_for(id);
        let bytes = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                error!("corrupt process record {path:?}: {e}");
                None
            }
        }
    }

    /// Subscribe to a live record's output events. `None` when the record is
    /// not live (terminal records have no event stream).
    pub async fn subscribe(&self, id: &str) -> Option<broadcast::Receiver<ProcessEvent>> {
        let live = self.live.read().await;
        live.get(id).map(|entry| entry.events.subscribe())
    }

    /// List records (memory + disk), newest first, filtered by status and/or
    /// session.
    pub async fn list(&self, filter: &ProcessFilter) -> Vec<ProcessRecord> {
        let mut records: Vec<ProcessRecord> = {
            let live = self.live.read().await;
            live.values().map(|e| e.record.clone()).collect()
        };

        if let Ok(mut dir) = tokio::fs::read_dir(&self.dir).await {
            while let Ok(Some(entry)) = dir.next_entry().await {
                let name = entry.file_name();
                let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                    continue;
                };
                // Live entries shadow any stale disk copy.
                if records.iter().any(|r| r.id == id) {
                    continue;
                }
                if let Some(record) = self.load_from_disk(id).await {
                    records.push(record);
                }
            }
        }

        records.retain(|r| {
            filter.status.is_none_or(|s| r.status == s)
                && filter
                    .session_id
                    .as_deref()
                    .is_none_or(|s| r.session_id == s)
        });
        records.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        records
    }

    /// Remove a record from memory and disk. `Err` when it never existed.
    pub async fn remove(&self, id: &str) -> Result<(), SandboxError> {
        let was_live = {
            let mut live = self.live.write().await;
            live.remove(id).is_some()
        };
        let disk = tokio::fs::remove_file(self.path_for(id)).await.is_ok();
        if was_live || disk {
            Ok(())
        } else {
            Err(SandboxError::not_found(format!("process {id} not found")))
        }
    }

    /// Whether the record is still live (used by port watches tied to a
    /// process).
    pub async fn is_live(&self, id: &str) -> bool {
        self.live.read().await.contains_key(id)
    }
}

/// Append to an output buffer without exceeding `max` bytes.
fn append_capped(buf: &mut String, data: &str, max: usize) {
    if buf.len() >= max {
        return;
    }
    let room = max - buf.len();
    if data.len() <= room {
        buf.push_str(data);
    } else {
        let mut end = room;
        while end > 0 && !data.is_char_boundary(end) {
            end -= 1;
        }
        buf.push_str(&data[..end]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (ProcessStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (ProcessStore::new(dir.path(), 1024), dir)
    }

    #[tokio::test]
    async fn create_update_get() {
        let (store, _dir) = store();
        store
            .create(ProcessRecord::new("p1", "s1", "echo hi", None))
            .await;
        store
            .update(
                "p1",
                ProcessPatch {
                    status: Some(ProcessStatus::Running),
                    pid: Some(42),
                    ..ProcessPatch::default()
                },
            )
            .await;
        let rec = store.get("p1").await.unwrap();
        assert_eq!(rec.status, ProcessStatus::Running);
        assert_eq!(rec.pid, Some(42));
        assert!(store.is_live("p1").await);
    }

    #[tokio::test]
    async fn terminal_status_persists_and_evicts() {
        let (store, dir) = store();
        store
            .create(ProcessRecord::new("p2", "s1", "true", None))
            .await;
        store
            .update(
                "p2",
                ProcessPatch {
                    status: Some(ProcessStatus::Completed),
                    exit_code: Some(0),
                    ..ProcessPatch::default()
                },
            )
            .await;

        assert!(!store.is_live("p2").await);
        assert!(dir.path().join("p2.json").exists());

        let rec = store.get("p2").await.unwrap();
        assert_eq!(rec.status, ProcessStatus::Completed);
        assert_eq!(rec.exit_code, Some(0));
        assert!(rec.end_time.is_some());
    }

    #[tokio::test]
    async fn terminal_records_are_immutable() {
        let (store, _dir) = store();
        store
            .create(ProcessRecord::new("p3", "s1", "false", None))
            .await;
        store
            .update(
                "p3",
                ProcessPatch {
                    status: Some(ProcessStatus::Failed),
                    exit_code: Some(1),
                    ..ProcessPatch::default()
                },
            )
            .await;

        // An update after termination must not resurrect the record.
        store
            .update(
                "p3",
                ProcessPatch {
                    status: Some(ProcessStatus::Running),
                    ..ProcessPatch::default()
                },
            )
            .await;
        let rec = store.get("p3").await.unwrap();
        assert_eq!(rec.status, ProcessStatus::Failed);
        assert!(!store.is_live("p3").await);
    }

    #[tokio::test]
    async fn list_unions_memory_and_disk() {
        let (store, _dir) = store();
        store
            .create(ProcessRecord::new("live1", "s1", "sleep 1", None))
            .await;
        store
            .create(ProcessRecord::new("done1", "s2", "true", None))
            .await;
        store
            .update(
                "done1",
                ProcessPatch {
                    status: Some(ProcessStatus::Completed),
                    exit_code: Some(0),
                    ..ProcessPatch::default()
                },
            )
            .await;

        let all = store.list(&ProcessFilter::default()).await;
        assert_eq!(all.len(), 2);

        let completed = store
            .list(&ProcessFilter {
                status: Some(ProcessStatus::Completed),
                ..ProcessFilter::default()
            })
            .await;
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, "done1");

        let by_session = store
            .list(&ProcessFilter {
                session_id: Some("s1".to_string()),
                ..ProcessFilter::default()
            })
            .await;
        assert_eq!(by_session.len(), 1);
        assert_eq!(by_session[0].id, "live1");
    }

    #[tokio::test]
    async fn subscribe_receives_output_events() {
        let (store, _dir) = store();
        store
            .create(ProcessRecord::new("p4", "s1", "echo hi", None))
            .await;
        let mut rx = store.subscribe("p4").await.unwrap();
        store
            .update(
                "p4",
                ProcessPatch {
                    append_stdout: Some("hi\n".to_string()),
                    ..ProcessPatch::default()
                },
            )
            .await;
        match rx.recv().await.unwrap() {
            ProcessEvent::Stdout(data) => assert_eq!(data, "hi\n"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn remove_missing_errors() {
        let (store, _dir) = store();
        assert!(store.remove("ghost").await.is_err());
    }

    #[test]
    fn output_append_is_capped() {
        let mut buf = String::new();
        append_capped(&mut buf, &"x".repeat(600), 1024);
        append_capped(&mut buf, &"y".repeat(600), 1024);
        assert_eq!(buf.len(), 1024);
        append_capped(&mut buf, "z", 1024);
        assert_eq!(buf.len(), 1024);
    }
}
