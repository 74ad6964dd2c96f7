//! Session bookkeeping: the on-disk layout of a session and the registry shared by all engines.

use crate::result::SessionStatus;
use rand::Rng;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::{
    collections::VecDeque,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::{
    fs,
    sync::{oneshot, watch},
};

/// Content of the seed written when no corpus is given.
pub const DEFAULT_SEED: &[u8] = b"fuzz";

/// Terminal sessions kept for a late `status` call before the oldest is dropped.
pub const DEFAULT_RETAINED_SESSIONS: usize = 1024;

/// `{work_dir}/{session_id}/` with `input/` and `output/` below.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLayout {
    root: PathBuf,
}

impl SessionLayout {
    pub fn new<P: AsRef<Path>>(work_dir: P, session_id: &str) -> Self {
        Self {
            root: work_dir.as_ref().join(session_id),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn input_dir(&self) -> PathBuf {
        self.root.join("input")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.output_dir().join("queue")
    }

    pub fn crash_dir(&self) -> PathBuf {
        self.output_dir().join("crashes")
    }

    /// Combined output of the fuzzer process, written when the session ends.
    pub fn log_file(&self) -> PathBuf {
        self.output_dir().join("fuzzer.log")
    }

    /// Creates `input/` and `output/`. Fails if the session directory already exists, nothing is
    /// left behind if a subdirectory cannot be created.
    pub async fn create(&self) -> io::Result<()> {
        self.create_with(&[self.input_dir(), self.output_dir()]).await
    }

    async fn create_with(&self, subdirs: &[PathBuf]) -> io::Result<()> {
        if let Some(parent) = self.root.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::create_dir(&self.root).await?;
        for dir in subdirs {
            if let Err(e) = fs::create_dir(dir).await {
                if let Err(e) = self.remove().await {
                    log::warn!("failed to remove {}: {}", self.root.display(), e);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Copies seeds from `corpus` (a file or a directory) into `input/`. Writes a minimal seed if
    /// nothing was copied. Returns the number of seeds.
    pub async fn seed(&self, corpus: Option<&Path>) -> io::Result<usize> {
        let input = self.input_dir();
        let mut n = 0;
        if let Some(corpus) = corpus {
            if corpus.is_file() {
                let name = corpus
                    .file_name()
                    .map(|n| n.to_os_string())
                    .unwrap_or_else(|| "seed".into());
                fs::copy(corpus, input.join(name)).await?;
                n += 1;
            } else {
                let mut entries = fs::read_dir(corpus).await?;
                while let Some(entry) = entries.next_entry().await? {
                    if !entry.file_type().await?.is_file() {
                        continue;
                    }
                    fs::copy(entry.path(), input.join(entry.file_name())).await?;
                    n += 1;
                }
            }
        }
        if n == 0 {
            fs::write(input.join("seed"), DEFAULT_SEED).await?;
            n = 1;
        }
        Ok(n)
    }

    pub async fn remove(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.root).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub engine: String,
    pub pid: u32,
    pub status: SessionStatus,
}

#[derive(Debug)]
struct SessionEntry {
    engine: String,
    pid: u32,
    status: SessionStatus,
    stop_tx: Option<oneshot::Sender<()>>,
    status_tx: watch::Sender<SessionStatus>,
    status_rx: watch::Receiver<SessionStatus>,
}

#[derive(Debug, Default)]
struct Table {
    entries: FxHashMap<String, SessionEntry>,
    /// Ids of terminal sessions, oldest first.
    finished: VecDeque<String>,
}

#[derive(Debug)]
struct Inner {
    next_id: AtomicU64,
    retain: usize,
    table: Mutex<Table>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Session id -> (engine, pid, status) map shared by every adapter, plus the shutdown flag
/// watched by helper runs.
///
/// Every status change goes through the map lock and only a `Running` session can move to a
/// terminal status, so natural exit, timeout and stop cannot both finish one session. At most
/// `retain` terminal sessions are kept, the oldest is dropped first.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETAINED_SESSIONS)
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retain: usize) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(0),
                retain: retain.max(1),
                table: Mutex::new(Table::default()),
                shutdown_tx,
                shutdown_rx,
            }),
        }
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.inner
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// A fresh session id, never handed out twice by this registry.
    pub fn next_id(&self, engine: &str) -> String {
        let seq = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let engine = engine
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect::<String>();
        let salt: u32 = rand::thread_rng().gen();
        format!("{}-{}-{:08x}", engine, seq, salt)
    }

    /// Registers a running session, returns the receiver of stop requests.
    pub fn register(&self, id: &str, engine: &str, pid: u32) -> oneshot::Receiver<()> {
        let (stop_tx, stop_rx) = oneshot::channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::Running);
        let entry = SessionEntry {
            engine: engine.to_string(),
            pid,
            status: SessionStatus::Running,
            stop_tx: Some(stop_tx),
            status_tx,
            status_rx,
        };
        let old = self.table().entries.insert(id.to_string(), entry);
        debug_assert!(old.is_none(), "session id reused: {}", id);
        stop_rx
    }

    /// Moves a running session to `status`. Returns false if it was not running.
    pub fn finish(&self, id: &str, status: SessionStatus) -> bool {
        debug_assert!(status.is_terminal());
        let mut table = self.table();
        let Table { entries, finished } = &mut *table;
        match entries.get_mut(id) {
            Some(entry) if entry.status == SessionStatus::Running => {
                entry.status = status;
                entry.stop_tx = None;
                let _ = entry.status_tx.send(status);
            }
            _ => return false,
        }
        finished.push_back(id.to_string());
        while finished.len() > self.inner.retain {
            if let Some(old) = finished.pop_front() {
                entries.remove(&old);
            }
        }
        true
    }

    /// Status of `id`. A terminal status is reported once, the session is reaped afterwards.
    pub fn status(&self, id: &str) -> SessionStatus {
        let mut table = self.table();
        let status = match table.entries.get(id) {
            Some(entry) => entry.status,
            None => return SessionStatus::Unknown,
        };
        if status.is_terminal() {
            table.entries.remove(id);
        }
        status
    }

    /// Status of `id` without reaping it.
    pub fn peek(&self, id: &str) -> SessionStatus {
        self.table()
            .entries
            .get(id)
            .map(|e| e.status)
            .unwrap_or(SessionStatus::Unknown)
    }

    /// Asks the monitor of a running session to stop and waits until the session is terminal.
    /// No-op for unknown or finished sessions.
    pub async fn stop(&self, id: &str) {
        let mut status_rx = {
            let mut table = self.table();
            let entry = match table.entries.get_mut(id) {
                Some(entry) if entry.status == SessionStatus::Running => entry,
                _ => return,
            };
            if let Some(stop_tx) = entry.stop_tx.take() {
                // the monitor may have picked natural exit already.
                let _ = stop_tx.send(());
            }
            entry.status_rx.clone()
        };
        while !status_rx.borrow().is_terminal() {
            if status_rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Running sessions, of `engine` only if given.
    pub fn running(&self, engine: Option<&str>) -> Vec<String> {
        self.table()
            .entries
            .iter()
            .filter(|(_, e)| e.status == SessionStatus::Running)
            .filter(|(_, e)| engine.map(|n| n == e.engine).unwrap_or(true))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Drops every entry of `engine`.
    pub fn clear(&self, engine: &str) {
        self.table().entries.retain(|_, e| e.engine != engine);
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut ret = self
            .table()
            .entries
            .iter()
            .map(|(id, e)| SessionInfo {
                id: id.clone(),
                engine: e.engine.clone(),
                pid: e.pid,
                status: e.status,
            })
            .collect::<Vec<_>>();
        ret.sort_by(|a, b| a.id.cmp(&b.id));
        ret
    }

    /// Makes helper runs give up and refuses new sessions. Running sessions are left to `stop`.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.inner.shutdown_rx.borrow()
    }

    /// Resolves once `shutdown` has been called.
    pub async fn shutdown_requested(&self) {
        let mut rx = self.inner.shutdown_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
