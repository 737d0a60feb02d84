//! Exposed-port registry and readiness watching.
//!
//! The registry tracks which container ports a caller has exposed (so the
//! proxy will forward to them). `watch` polls a port until it accepts
//! connections — via TCP connect or an HTTP request whose status must fall
//! in a configurable range — emitting `watching`, `ready`,
//! `process_exited`, and `error` events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::Empty;
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use crate::error::SandboxError;
use crate::process::ProcessStore;
use crate::util::now_ms;

/// Poll interval clamp, per the watch contract.
const MIN_INTERVAL_MS: u64 = 100;
const MAX_INTERVAL_MS: u64 = 10_000;

/// Per-probe connection deadline.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// One exposed port.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortRegistration {
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub exposed_at: u64,
    pub status: String,
}

/// Registry of exposed ports.
#[derive(Clone, Default)]
pub struct PortRegistry {
    ports: Arc<RwLock<HashMap<u16, PortRegistration>>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose a port. Port 0 is invalid; duplicates conflict.
    pub async fn expose(
        &self,
        port: u16,
        name: Option<String>,
    ) -> Result<PortRegistration, SandboxError> {
        if port == 0 {
            return Err(SandboxError::validation("port must be between 1 and 65535"));
        }
        let mut ports = self.ports.write().await;
        if ports.contains_key(&port) {
            return Err(SandboxError::conflict(format!("port {port} already exposed")));
        }
        let registration = PortRegistration {
            port,
            name,
            exposed_at: now_ms(),
            status: "exposed".to_string(),
        };
        ports.insert(port, registration.clone());
        info!("port {port} exposed");
        Ok(registration)
    }

    pub async fn unexpose(&self, port: u16) -> Result<PortRegistration, SandboxError> {
        let mut ports = self.ports.write().await;
        ports
            .remove(&port)
            .ok_or_else(|| SandboxError::not_found(format!("port {port} is not exposed")))
    }

    pub async fn list(&self) -> Vec<PortRegistration> {
        let mut items: Vec<PortRegistration> = self.ports.read().await.values().cloned().collect();
        items.sort_by_key(|r| r.port);
        items
    }

    pub async fn is_exposed(&self, port: u16) -> bool {
        self.ports.read().await.contains_key(&port)
    }
}

/// How a watched port is probed for readiness.
#[derive(Debug, Clone)]
pub enum ProbeMode {
    /// Plain TCP connect.
    Tcp,
    /// HTTP GET on `path`; ready iff the status falls in `[min, max]`.
    Http { path: String, min: u16, max: u16 },
}

/// Parameters for one readiness watch.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub port: u16,
    pub interval_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub probe: ProbeMode,
    /// When set, the watch ends with `process_exited` once this process
    /// record is no longer live.
    pub process_id: Option<String>,
}

/// Events emitted by a watch, in order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WatchEvent {
    Watching { port: u16 },
    Ready { port: u16, elapsed_ms: u64 },
    ProcessExited { port: u16, process_id: String },
    Error { port: u16, message: String },
}

/// Start watching a port; events arrive on the returned channel and the
/// watch task ends after the first terminal event (`ready`,
/// `process_exited`, or `error`).
pub fn watch(opts: WatchOptions, store: ProcessStore) -> mpsc::Receiver<WatchEvent> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(watch_loop(opts, store, tx));
    rx
}

async fn watch_loop(opts: WatchOptions, store: ProcessStore, tx: mpsc::Sender<WatchEvent>) {
    let interval = Duration::from_millis(
        opts.interval_ms
            .unwrap_or(1000)
            .clamp(MIN_INTERVAL_MS, MAX_INTERVAL_MS),
    );
    let deadline = opts
        .timeout_ms
        .map(|t| tokio::time::Instant::now() + Duration::from_millis(t));
    let started = std::time::Instant::now();

    if tx
        .send(WatchEvent::Watching { port: opts.port })
        .await
        .is_err()
    {
        return;
    }

    loop {
        if let Some(ref process_id) = opts.process_id {
            if !store.is_live(process_id).await {
                let _ = tx
                    .send(WatchEvent::ProcessExited {
                        port: opts.port,
                        process_id: process_id.clone(),
                    })
                    .await;
                return;
            }
        }

        match probe(opts.port, &opts.probe).await {
            Ok(true) => {
                #[allow(clippy::cast_possible_truncation)]
                let elapsed_ms = started.elapsed().as_millis() as u64;
                let _ = tx
                    .send(WatchEvent::Ready {
                        port: opts.port,
                        elapsed_ms,
                    })
                    .await;
                return;
            }
            Ok(false) => {}
            Err(message) => {
                let _ = tx
                    .send(WatchEvent::Error {
                        port: opts.port,
                        message,
                    })
                    .await;
                return;
            }
        }

        if let Some(deadline) = deadline {
            if tokio::time::Instant::now() >= deadline {
                let _ = tx
                    .send(WatchEvent::Error {
                        port: opts.port,
                        message: format!("port {} not ready before timeout", opts.port),
                    })
                    .await;
                return;
            }
        }
        // The consumer may have disconnected; stop polling if so.
        if tx.is_closed() {
            debug!("port watch {} cancelled by consumer", opts.port);
            return;
        }
        tokio::time::sleep(interval).await;
    }
}

/// One readiness probe. `Ok(false)` means "not ready yet, keep polling";
/// `Err` is a non-retryable failure.
async fn probe(port: u16, mode: &ProbeMode) -> Result<bool, String> {
    match mode {
        ProbeMode::Tcp => {
            let connect = tokio::net::TcpStream::connect(("127.0.0.1", port));
            match tokio::time::timeout(PROBE_TIMEOUT, connect).await {
                Ok(Ok(_)) => Ok(true),
                _ => Ok(false),
            }
        }
        ProbeMode::Http { path, min, max } => {
            let uri: hyper::Uri = format!("http://127.0.0.1:{port}{path}")
                .parse()
                .map_err(|e| format!("invalid probe path: {e}"))?;
            let client: Client<_, Empty<Bytes>> =
                Client::builder(TokioExecutor::new()).build_http();
            match tokio::time::timeout(PROBE_TIMEOUT, client.get(uri)).await {
                Ok(Ok(resp)) => {
                    let status = resp.status().as_u16();
                    Ok(status >= *min && status <= *max)
                }
                _ => Ok(false),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ProcessPatch, ProcessRecord, ProcessStatus};

    fn test_store() -> (ProcessStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (ProcessStore::new(dir.path(), 1024), dir)
    }

    #[tokio::test]
    async fn expose_validates_and_conflicts() {
        let reg = PortRegistry::new();
        assert!(reg.expose(0, None).await.is_err());

        reg.expose(8080, Some("web".to_string())).await.unwrap();
        let err = reg.expose(8080, None).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Conflict);

        assert_eq!(reg.list().await.len(), 1);
        assert!(reg.is_exposed(8080).await);

        reg.unexpose(8080).await.unwrap();
        assert!(reg.unexpose(8080).await.is_err());
    }

    #[tokio::test]
    async fn watch_reports_ready_for_listening_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (store, _dir) = test_store();

        let mut rx = watch(
            WatchOptions {
                port,
                interval_ms: Some(100),
                timeout_ms: Some(5000),
                probe: ProbeMode::Tcp,
                process_id: None,
            },
            store,
        );

        assert!(matches!(rx.recv().await, Some(WatchEvent::Watching { .. })));
        match rx.recv().await {
            Some(WatchEvent::Ready { port: p, .. }) => assert_eq!(p, port),
            other => panic!("expected ready, got {other:?}"),
        }
        drop(listener);
    }

    #[tokio::test]
    async fn watch_times_out_on_dead_port() {
        let (store, _dir) = test_store();
        // Bind then drop to get a port that is almost certainly closed.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut rx = watch(
            WatchOptions {
                port,
                interval_ms: Some(100),
                timeout_ms: Some(400),
                probe: ProbeMode::Tcp,
                process_id: None,
            },
            store,
        );
        assert!(matches!(rx.recv().await, Some(WatchEvent::Watching { .. })));
        let mut terminal = None;
        while let Some(ev) = rx.recv().await {
            terminal = Some(ev);
        }
        assert!(matches!(terminal, Some(WatchEvent::Error { .. })));
    }

    #[tokio::test]
    async fn watch_stops_when_process_exits() {
        let (store, _dir) = test_store();
        store
            .create(ProcessRecord::new("p1", "s1", "server", None))
            .await;
        store
            .update(
                "p1",
                ProcessPatch {
                    status: Some(ProcessStatus::Failed),
                    exit_code: Some(1),
                    ..ProcessPatch::default()
                },
            )
            .await;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut rx = watch(
            WatchOptions {
                port,
                interval_ms: Some(100),
                timeout_ms: Some(5000),
                probe: ProbeMode::Tcp,
                process_id: Some("p1".to_string()),
            },
            store,
        );
        assert!(matches!(rx.recv().await, Some(WatchEvent::Watching { .. })));
        match rx.recv().await {
            Some(WatchEvent::ProcessExited { process_id, .. }) => assert_eq!(process_id, "p1"),
            other => panic!("expected process_exited, got {other:?}"),
        }
    }

    #[test]
    fn watch_event_wire_shape() {
        let ev = WatchEvent::Ready {
            port: 8080,
            elapsed_ms: 42,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], "ready");
        assert_eq!(v["port"], 8080);
    }
}
