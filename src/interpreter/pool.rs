//! Per-language interpreter worker pools.
//!
//! Each language keeps a list of workers, a free list of *available*
//! (unowned) workers, and a mapping of context id → reserved worker. All
//! pool mutations happen under the per-language mutex; executions are
//! serialized per worker by a lazily-created execution lock that is torn
//! down on the shared worker-death cleanup path.
//!
//! Pre-warm fills each free list to `min_size` at startup. Idle eviction
//! runs at half the idle timeout and only ever touches unowned workers,
//! never below `min_size`. Context workers are killed on release — they
//! have acquired user state and must not re-enter the free list.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{InterpreterConfig, PoolConfig};
use crate::error::{ErrorKind, SandboxError};
use crate::util::now_ms;

use super::worker::InterpreterWorker;
use super::{Language, WorkerResponse};

const PYTHON_WORKER_SOURCE: &str = include_str!("workers/python_worker.py");
const NODE_WORKER_SOURCE: &str = include_str!("workers/node_worker.js");

/// Deadline for the `python3 --version` availability probe.
const PYTHON_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Metadata for one interpreter context. Exactly one worker is reserved for
/// its lifetime; switching language is forbidden.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextInfo {
    #[serde(rename = "contextId")]
    pub id: String,
    pub language: Language,
    pub cwd: String,
    pub created_at: u64,
    pub last_used: u64,
}

/// Pool health surfaced by `/api/interpreter/health`.
#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub ready: bool,
    pub initializing: bool,
    /// Pre-warm progress in percent (0–100).
    pub progress: u8,
}

#[derive(Default)]
struct LanguagePool {
    /// Every worker of this language, owned or not.
    workers: Vec<Arc<InterpreterWorker>>,
    /// Unowned workers, oldest first.
    available: VecDeque<Arc<InterpreterWorker>>,
    /// Per-worker execution locks, created lazily on first borrow/reserve.
    locks: HashMap<String, Arc<Mutex<()>>>,
    /// Context id → reserved worker.
    bound: HashMap<String, Arc<InterpreterWorker>>,
}

/// Owner of all language pools and interpreter contexts.
pub struct InterpreterPool {
    pools: HashMap<Language, Mutex<LanguagePool>>,
    contexts: RwLock<HashMap<String, ContextInfo>>,
    config: InterpreterConfig,
    default_cwd: String,
    worker_dir: PathBuf,
    python_available: AtomicBool,
    ready: AtomicBool,
    prewarm_done: AtomicUsize,
    prewarm_target: AtomicUsize,
    exit_tx: mpsc::UnboundedSender<(Language, String)>,
    background: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl InterpreterPool {
    /// Create the pool: materialize the embedded worker programs and start
    /// the worker-death reaper. Does not spawn any interpreter yet — call
    /// [`InterpreterPool::initialize`] for the probe + pre-warm pass.
    pub fn new(
        config: InterpreterConfig,
        default_cwd: &str,
        temp_base: &std::path::Path,
    ) -> Result<Arc<Self>, SandboxError> {
        let worker_dir = temp_base.join(format!("sandbox_workers_{}", std::process::id()));
        {
            use std::os::unix::fs::DirBuilderExt;
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(&worker_dir)
                .map_err(|e| {
                    SandboxError::io(format!("failed to create worker dir {worker_dir:?}: {e}"))
                })?;
        }
        std::fs::write(worker_dir.join("python_worker.py"), PYTHON_WORKER_SOURCE)
            .map_err(|e| SandboxError::io(format!("failed to write python worker: {e}")))?;
        std::fs::write(worker_dir.join("node_worker.js"), NODE_WORKER_SOURCE)
            .map_err(|e| SandboxError::io(format!("failed to write node worker: {e}")))?;

        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(Self {
            pools: Language::ALL
                .into_iter()
                .map(|l| (l, Mutex::new(LanguagePool::default())))
                .collect(),
            contexts: RwLock::new(HashMap::new()),
            config,
            default_cwd: default_cwd.to_string(),
            worker_dir,
            python_available: AtomicBool::new(true),
            ready: AtomicBool::new(false),
            prewarm_done: AtomicUsize::new(0),
            prewarm_target: AtomicUsize::new(1),
            exit_tx,
            background: Mutex::new(Vec::new()),
        });

        // Worker-death reaper: unexpected exits funnel through here into the
        // same cleanup used by eviction and release.
        let reaper_pool = Arc::clone(&pool);
        let reaper = tokio::spawn(async move {
            while let Some((language, worker_id)) = exit_rx.recv().await {
                reaper_pool.remove_worker(language, &worker_id).await;
            }
        });
        pool.background.try_lock().expect("fresh mutex").push(reaper);

        Ok(pool)
    }

    /// Probe interpreter availability and pre-warm every language pool to
    /// `min_size`. Spawn failures are logged and swallowed.
    pub async fn initialize(self: &Arc<Self>) {
        let python_ok = probe_python().await;
        self.python_available.store(python_ok, Ordering::SeqCst);
        if !python_ok {
            warn!("python3 not available; python executions will be rejected");
        }

        let mut target = 0;
        for language in Language::ALL {
            if language == Language::Python && !python_ok {
                continue;
            }
            target += self.pool_config(language).min_size;
        }
        self.prewarm_target.store(target.max(1), Ordering::SeqCst);
        self.prewarm_done.store(0, Ordering::SeqCst);

        for language in Language::ALL {
            if language == Language::Python && !python_ok {
                continue;
            }
            self.pre_warm(language).await;
        }
        self.ready.store(true, Ordering::SeqCst);
        info!("interpreter pools ready");

        // Idle eviction, per language, at half the idle timeout.
        for language in Language::ALL {
            let interval =
                Duration::from_millis((self.pool_config(language).idle_timeout_ms / 2).max(1000));
            let pool = Arc::clone(self);
            let task = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    pool.cleanup_idle(language).await;
                }
            });
            self.background.lock().await.push(task);
        }
    }

    fn pool_config(&self, language: Language) -> &PoolConfig {
        match language {
            Language::Python => &self.config.python,
            Language::Javascript => &self.config.javascript,
            Language::Typescript => &self.config.typescript,
        }
    }

    fn script_path(&self, language: Language) -> PathBuf {
        match language {
            Language::Python => self.worker_dir.join("python_worker.py"),
            Language::Javascript | Language::Typescript => {
                self.worker_dir.join("node_worker.js")
            }
        }
    }

    fn require_language_available(&self, language: Language) -> Result<(), SandboxError> {
        if language == Language::Python && !self.python_available.load(Ordering::SeqCst) {
            return Err(SandboxError::new(
                ErrorKind::LanguageUnavailable,
                "Python is not available in this container; retry after installing python3",
            ));
        }
        Ok(())
    }

    async fn spawn_worker(
        &self,
        language: Language,
        cwd: &str,
    ) -> Result<Arc<InterpreterWorker>, SandboxError> {
        let worker = InterpreterWorker::spawn(
            language,
            &self.script_path(language),
            cwd,
            Duration::from_millis(self.config.spawn_timeout_ms),
            self.exit_tx.clone(),
        )
        .await?;
        Ok(Arc::new(worker))
    }

    /// Fill the language's free list to `min_size` (never past
    /// `max_processes` counting owned workers).
    pub async fn pre_warm(&self, language: Language) {
        let cfg = self.pool_config(language);
        let min = cfg.min_size;
        let max = cfg.max_processes;
        loop {
            {
                let pool = self.pools[&language].lock().await;
                if pool.available.len() >= min {
                    break;
                }
                if max.is_some_and(|m| pool.workers.len() >= m) {
                    break;
                }
            }
            match self.spawn_worker(language, &self.default_cwd).await {
                Ok(worker) => {
                    let mut pool = self.pools[&language].lock().await;
                    pool.workers.push(Arc::clone(&worker));
                    pool.available.push_back(worker);
                    self.prewarm_done.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    warn!("pre-warm {language}: {e}");
                    break;
                }
            }
        }
    }

    /// Pop an available worker, spawning one when allowed by `max_processes`.
    async fn borrow(&self, language: Language) -> Result<Arc<InterpreterWorker>, SandboxError> {
        let mut pool = self.pools[&language].lock().await;
        while let Some(worker) = pool.available.pop_front() {
            if worker.is_alive() {
                pool.ensure_lock(&worker.id);
                return Ok(worker);
            }
        }
        if let Some(max) = self.pool_config(language).max_processes {
            if pool.workers.len() >= max {
                return Err(SandboxError::new(
                    ErrorKind::ResourceExhausted,
                    format!("{language} worker limit reached (max {max})"),
                ));
            }
        }
        let worker = self.spawn_worker(language, &self.default_cwd).await?;
        pool.workers.push(Arc::clone(&worker));
        pool.ensure_lock(&worker.id);
        Ok(worker)
    }

    /// Push a borrowed worker back on the free list (if it is still alive
    /// and still a pool member).
    async fn return_worker(&self, language: Language, worker: Arc<InterpreterWorker>) {
        let mut pool = self.pools[&language].lock().await;
        if worker.is_alive() && pool.workers.iter().any(|w| w.id == worker.id) {
            pool.available.push_back(worker);
        }
    }

    /// Execute code, either on the context's reserved worker or on a
    /// transiently borrowed one. Executions on the same worker serialize on
    /// its lock.
    pub async fn execute(
        &self,
        language: Language,
        code: &str,
        context_id: Option<&str>,
        timeout_ms: Option<u64>,
    ) -> Result<WorkerResponse, SandboxError> {
        self.require_language_available(language)?;
        let timeout = timeout_ms.or(Some(self.config.execution_timeout_ms));

        if let Some(context_id) = context_id {
            let info = {
                let contexts = self.contexts.read().await;
                contexts.get(context_id).cloned()
            }
            .ok_or_else(|| {
                SandboxError::not_found(format!("context {context_id} not found"))
            })?;
            if info.language != language {
                return Err(SandboxError::new(
                    ErrorKind::Precondition,
                    format!(
                        "context {context_id} is bound to {}, not {language}",
                        info.language
                    ),
                ));
            }

            let (worker, lock) = {
                let mut pool = self.pools[&language].lock().await;
                let worker = pool.bound.get(context_id).cloned().ok_or_else(|| {
                    SandboxError::new(
                        ErrorKind::Precondition,
                        format!("worker for context {context_id} has terminated"),
                    )
                })?;
                let lock = pool.ensure_lock(&worker.id);
                (worker, lock)
            };

            let _exclusive = lock.lock().await;
            let response = worker.execute(code, timeout).await?;
            {
                let mut contexts = self.contexts.write().await;
                if let Some(c) = contexts.get_mut(context_id) {
                    c.last_used = now_ms();
                }
            }
            Ok(response)
        } else {
            let worker = self.borrow(language).await?;
            let lock = {
                let mut pool = self.pools[&language].lock().await;
                pool.ensure_lock(&worker.id)
            };
            let result = {
                let _exclusive = lock.lock().await;
                worker.execute(code, timeout).await
            };
            self.return_worker(language, worker).await;
            result
        }
    }

    /// Reserve a worker exclusively for a new context.
    pub async fn create_context(
        self: &Arc<Self>,
        language: Language,
        cwd: Option<&str>,
    ) -> Result<ContextInfo, SandboxError> {
        self.require_language_available(language)?;

        let context_id = uuid::Uuid::new_v4().to_string();
        let cwd = cwd.unwrap_or(&self.default_cwd).to_string();

        // A context with a custom cwd needs its own interpreter process;
        // otherwise any pre-warmed worker will do.
        let worker = if cwd == self.default_cwd {
            self.borrow(language).await?
        } else {
            let worker = self.spawn_worker(language, &cwd).await?;
            let mut pool = self.pools[&language].lock().await;
            if let Some(max) = self.pool_config(language).max_processes {
                if pool.workers.len() >= max {
                    worker.kill();
                    return Err(SandboxError::new(
                        ErrorKind::ResourceExhausted,
                        format!("{language} worker limit reached (max {max})"),
                    ));
                }
            }
            pool.workers.push(Arc::clone(&worker));
            pool.ensure_lock(&worker.id);
            worker
        };

        {
            let mut pool = self.pools[&language].lock().await;
            pool.bound.insert(context_id.clone(), worker);
        }

        let info = ContextInfo {
            id: context_id.clone(),
            language,
            cwd,
            created_at: now_ms(),
            last_used: now_ms(),
        };
        self.contexts
            .write()
            .await
            .insert(context_id, info.clone());
        info!("context {} created ({language})", info.id);

        // Keep the free list at min_size now that one worker is owned.
        self.replenish(language);
        Ok(info)
    }

    /// Release a context: kill its worker (it has acquired user state and
    /// must not be reused) and refill the free list.
    pub async fn release_context(
        self: &Arc<Self>,
        context_id: &str,
    ) -> Result<ContextInfo, SandboxError> {
        let info = {
            let mut contexts = self.contexts.write().await;
            contexts.remove(context_id)
        }
        .ok_or_else(|| SandboxError::not_found(format!("context {context_id} not found")))?;

        let worker = {
            let mut pool = self.pools[&info.language].lock().await;
            let worker = pool.bound.remove(context_id);
            if let Some(ref w) = worker {
                pool.workers.retain(|x| x.id != w.id);
                pool.locks.remove(&w.id);
            }
            worker
        };
        if let Some(worker) = worker {
            worker.kill();
        }
        info!("context {context_id} released");
        self.replenish(info.language);
        Ok(info)
    }

    pub async fn get_context(&self, context_id: &str) -> Option<ContextInfo> {
        self.contexts.read().await.get(context_id).cloned()
    }

    pub async fn list_contexts(&self) -> Vec<ContextInfo> {
        let mut contexts: Vec<ContextInfo> =
            self.contexts.read().await.values().cloned().collect();
        contexts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        contexts
    }

    /// Evict available workers idle past the configured timeout, keeping at
    /// least `min_size` available. Owned workers are never touched.
    pub async fn cleanup_idle(&self, language: Language) {
        let cfg = self.pool_config(language);
        let cutoff = now_ms().saturating_sub(cfg.idle_timeout_ms);
        let evicted: Vec<Arc<InterpreterWorker>> = {
            let mut pool = self.pools[&language].lock().await;
            let mut evicted = Vec::new();
            while pool.available.len() > cfg.min_size {
                let Some(pos) = pool
                    .available
                    .iter()
                    .position(|w| w.last_used_ms() < cutoff)
                else {
                    break;
                };
                let worker = pool.available.remove(pos).expect("position valid");
                pool.workers.retain(|w| w.id != worker.id);
                pool.locks.remove(&worker.id);
                evicted.push(worker);
            }
            evicted
        };
        for worker in evicted {
            debug!("evicting idle {language} worker {}", worker.id);
            worker.kill();
        }
    }

    /// Shared cleanup for unexpected worker exits: remove the worker from
    /// every structure and invalidate any context pinned to it.
    async fn remove_worker(self: &Arc<Self>, language: Language, worker_id: &str) {
        let orphaned: Vec<String> = {
            let mut pool = self.pools[&language].lock().await;
            pool.workers.retain(|w| w.id != worker_id);
            pool.available.retain(|w| w.id != worker_id);
            pool.locks.remove(worker_id);
            let orphaned: Vec<String> = pool
                .bound
                .iter()
                .filter(|(_, w)| w.id == worker_id)
                .map(|(cid, _)| cid.clone())
                .collect();
            for cid in &orphaned {
                pool.bound.remove(cid);
            }
            orphaned
        };
        for cid in &orphaned {
            // The context metadata stays so later calls fail with a
            // precondition error rather than NOT_FOUND.
            warn!("context {cid}: worker died, context is now invalid");
        }
        debug!("worker {worker_id} ({language}) removed from pool");
        self.replenish(language);
    }

    /// Spawn-and-refill on a detached task (release paths should not block
    /// on a ready handshake).
    fn replenish(self: &Arc<Self>, language: Language) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            if pool.ready.load(Ordering::SeqCst) {
                pool.pre_warm(language).await;
            }
        });
    }

    pub fn health(&self) -> PoolHealth {
        let ready = self.ready.load(Ordering::SeqCst);
        let done = self.prewarm_done.load(Ordering::SeqCst);
        let target = self.prewarm_target.load(Ordering::SeqCst).max(1);
        #[allow(clippy::cast_possible_truncation)]
        let progress = if ready {
            100
        } else {
            ((done * 100) / target).min(99) as u8
        };
        PoolHealth {
            ready,
            initializing: !ready,
            progress,
        }
    }

    pub fn python_available(&self) -> bool {
        self.python_available.load(Ordering::SeqCst)
    }

    /// Kill every worker and stop background tasks. Called on container exit.
    pub async fn shutdown(&self) {
        for task in self.background.lock().await.drain(..) {
            task.abort();
        }
        for language in Language::ALL {
            let mut pool = self.pools[&language].lock().await;
            for worker in pool.workers.drain(..) {
                worker.kill();
            }
            pool.available.clear();
            pool.locks.clear();
            pool.bound.clear();
        }
        self.contexts.write().await.clear();
        info!("interpreter pools shut down");
    }
}

impl LanguagePool {
    /// Lazily create the execution lock for a worker.
    fn ensure_lock(&mut self, worker_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(worker_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

/// `python3 --version`, success iff exit status 0 within the probe timeout.
async fn probe_python() -> bool {
    let probe = tokio::process::Command::new("python3")
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();
    match tokio::time::timeout(PYTHON_PROBE_TIMEOUT, probe).await {
        Ok(Ok(status)) => status.success(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(max_python: Option<usize>) -> (Arc<InterpreterPool>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = InterpreterConfig {
            python: PoolConfig {
                max_processes: max_python,
                ..PoolConfig::default()
            },
            ..InterpreterConfig::default()
        };
        let pool = InterpreterPool::new(config, "/tmp", dir.path()).unwrap();
        (pool, dir)
    }

    #[tokio::test]
    async fn worker_scripts_materialized() {
        let (pool, _dir) = test_pool(None);
        assert!(pool.worker_dir.join("python_worker.py").exists());
        assert!(pool.worker_dir.join("node_worker.js").exists());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn python_unavailable_is_rejected() {
        let (pool, _dir) = test_pool(None);
        pool.python_available.store(false, Ordering::SeqCst);

        let err = pool
            .execute(Language::Python, "1+1", None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::LanguageUnavailable);

        let err = pool
            .create_context(Language::Python, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::LanguageUnavailable);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn borrow_respects_max_processes() {
        let (pool, _dir) = test_pool(Some(0));
        let err = pool.borrow(Language::Python).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ResourceExhausted);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_context_is_not_found() {
        let (pool, _dir) = test_pool(None);
        let err = pool
            .execute(Language::Python, "1", Some("ghost"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn language_mismatch_is_precondition() {
        let (pool, _dir) = test_pool(None);
        pool.contexts.write().await.insert(
            "ctx1".to_string(),
            ContextInfo {
                id: "ctx1".to_string(),
                language: Language::Python,
                cwd: "/tmp".to_string(),
                created_at: now_ms(),
                last_used: now_ms(),
            },
        );
        let err = pool
            .execute(Language::Javascript, "1", Some("ctx1"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Precondition);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn dead_context_worker_is_precondition() {
        let (pool, _dir) = test_pool(None);
        // Context metadata exists but no bound worker (the reaper removed it).
        pool.contexts.write().await.insert(
            "ctx2".to_string(),
            ContextInfo {
                id: "ctx2".to_string(),
                language: Language::Python,
                cwd: "/tmp".to_string(),
                created_at: now_ms(),
                last_used: now_ms(),
            },
        );
        let err = pool
            .execute(Language::Python, "1", Some("ctx2"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Precondition);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn release_unknown_context_is_not_found() {
        let (pool, _dir) = test_pool(None);
        let err = pool.release_context("ghost").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn health_reports_initializing_then_ready() {
        let (pool, _dir) = test_pool(None);
        let h = pool.health();
        assert!(!h.ready);
        assert!(h.initializing);
        pool.ready.store(true, Ordering::SeqCst);
        let h = pool.health();
        assert!(h.ready);
        assert_eq!(h.progress, 100);
        pool.shutdown().await;
    }
}
