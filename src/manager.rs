//! Lifecycle and concurrency around the active index snapshot.
//!
//! The manager owns exactly two pieces of shared mutable state: the pointer to
//! the active snapshot and the lifecycle flag. Both sit behind locks that are
//! only held to read or swap them. Builds run on a worker thread and are
//! swapped in once complete, so searches always see one fully built snapshot
//! and never wait for a build.
//!
//! At most one worker exists at a time. A worker abandoned at its deadline
//! keeps the slot until it has actually exited, and new loads or rebuilds are
//! rejected until then.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use crossbeam_channel::RecvTimeoutError;
use facematch_index::{Embedding, IndexFiles, IndexSnapshot, StagedFiles};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{PartialDataError, RebuildError, SearchError};
use crate::rebuild::build_snapshot;
use crate::record::RowKey;
use crate::storage::EmbeddingRecordStore;

pub const DEFAULT_REBUILD_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    Unloaded,
    Loading,
    Ready,
    Rebuilding,
}

/// One nearest-neighbor hit, nearest first within a search result.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCandidate {
    pub row_key: RowKey,
    pub distance: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub state: IndexState,
    pub vector_count: usize,
    pub last_built_at: Option<SystemTime>,
    pub build_id: Option<Uuid>,
    pub skipped_rows: usize,
    pub last_error: Option<String>,
    /// An abandoned worker is still winding down; rebuilds are rejected.
    pub draining: bool,
}

/// What a successful load or rebuild produced.
#[derive(Debug, Clone)]
pub struct RebuildReport {
    pub vector_count: usize,
    pub skipped: Vec<PartialDataError>,
    pub duplicates: usize,
    pub build_id: Uuid,
    pub built_at: SystemTime,
    /// True when the snapshot came from the persisted artifacts rather than
    /// a fresh build.
    pub from_disk: bool,
}

#[derive(Debug)]
struct Lifecycle {
    state: IndexState,
    skipped_rows: usize,
    last_error: Option<String>,
}

/// Worker output handed back to the manager for the swap.
struct Prepared {
    snapshot: IndexSnapshot,
    staged: Option<StagedFiles>,
    skipped: Vec<PartialDataError>,
    duplicates: usize,
    from_disk: bool,
}

pub struct IndexManager {
    store: Arc<dyn EmbeddingRecordStore>,
    files: IndexFiles,
    rebuild_timeout: Duration,
    snapshot: RwLock<Option<Arc<IndexSnapshot>>>,
    lifecycle: Mutex<Lifecycle>,
    settled: Condvar,
    worker_active: Arc<AtomicBool>,
}

/// Holds the single worker slot until dropped, including on unwind.
struct WorkerSlot(Arc<AtomicBool>);

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl IndexManager {
    pub fn new(store: Arc<dyn EmbeddingRecordStore>, files: IndexFiles) -> Self {
        Self {
            store,
            files,
            rebuild_timeout: DEFAULT_REBUILD_TIMEOUT,
            snapshot: RwLock::new(None),
            lifecycle: Mutex::new(Lifecycle {
                state: IndexState::Unloaded,
                skipped_rows: 0,
                last_error: None,
            }),
            settled: Condvar::new(),
            worker_active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_rebuild_timeout(mut self, timeout: Duration) -> Self {
        self.rebuild_timeout = timeout;
        self
    }

    pub fn files(&self) -> &IndexFiles {
        &self.files
    }

    pub fn state(&self) -> IndexState {
        self.lifecycle.lock().state
    }

    pub fn status(&self) -> IndexStatus {
        let (state, skipped_rows, last_error) = {
            let life = self.lifecycle.lock();
            (life.state, life.skipped_rows, life.last_error.clone())
        };
        let snapshot = self.snapshot();
        IndexStatus {
            state,
            vector_count: snapshot.as_ref().map_or(0, |s| s.len()),
            last_built_at: snapshot.as_ref().map(|s| s.built_at()),
            build_id: snapshot.as_ref().map(|s| s.build_id()),
            skipped_rows,
            last_error,
            draining: self.is_draining(),
        }
    }

    /// True while a worker abandoned at its deadline is still running.
    pub fn is_draining(&self) -> bool {
        let state = self.lifecycle.lock().state;
        matches!(state, IndexState::Ready | IndexState::Unloaded)
            && self.worker_active.load(Ordering::SeqCst)
    }

    /// The active snapshot, if any. Holding the returned `Arc` keeps that
    /// snapshot alive even if a rebuild swaps in a newer one.
    pub fn snapshot(&self) -> Option<Arc<IndexSnapshot>> {
        self.snapshot.read().clone()
    }

    /// Nearest `k` rows of the active snapshot, loading it on first use.
    pub fn search(&self, query: &Embedding, k: usize) -> Result<Vec<MatchCandidate>, SearchError> {
        let snapshot = match self.snapshot() {
            Some(snapshot) => snapshot,
            None => {
                if !self.ensure_loaded() {
                    return Err(SearchError::IndexUnavailable(self.unavailable_cause()));
                }
                self.snapshot()
                    .ok_or_else(|| SearchError::IndexUnavailable(self.unavailable_cause()))?
            }
        };

        Ok(snapshot
            .search(query, k)
            .into_iter()
            .map(|(key, distance)| MatchCandidate {
                row_key: RowKey::from(key),
                distance,
            })
            .collect())
    }

    /// Make sure a snapshot is active, loading the persisted pair or building
    /// from the store if needed. Concurrent callers wait for a load already
    /// in flight. Returns false if no snapshot could be made active.
    pub fn ensure_loaded(&self) -> bool {
        if self.snapshot.read().is_some() {
            return true;
        }

        {
            let mut life = self.lifecycle.lock();
            loop {
                match life.state {
                    IndexState::Unloaded => {
                        if self.worker_active.load(Ordering::SeqCst) {
                            log::warn!("index load skipped: abandoned worker still running");
                            return false;
                        }
                        break;
                    }
                    IndexState::Ready | IndexState::Rebuilding => {
                        return self.snapshot.read().is_some();
                    }
                    IndexState::Loading => {
                        let waited = self.settled.wait_for(&mut life, self.rebuild_timeout);
                        if waited.timed_out() {
                            log::warn!(
                                "gave up waiting for the index load after {:?}",
                                self.rebuild_timeout
                            );
                            return false;
                        }
                        if life.state == IndexState::Unloaded {
                            // The load we waited on failed; do not retry in a loop
                            return false;
                        }
                    }
                }
            }
            life.state = IndexState::Loading;
        }

        match self.run_worker(true) {
            Ok(prepared) => self.install(prepared, IndexState::Unloaded).is_ok(),
            Err(e) => {
                self.fail(IndexState::Unloaded, &e);
                false
            }
        }
    }

    /// Rebuild from the store and swap the result in. Failures are logged
    /// and leave the previous snapshot active.
    pub fn rebuild(&self) -> bool {
        self.try_rebuild().is_ok()
    }

    /// Like `rebuild`, but with the typed outcome. A call made while a load
    /// or rebuild is running is rejected with `AlreadyInProgress`.
    pub fn try_rebuild(&self) -> Result<RebuildReport, RebuildError> {
        let previous = {
            let mut life = self.lifecycle.lock();
            if self.worker_active.load(Ordering::SeqCst) {
                log::warn!("rebuild rejected: abandoned worker still running");
                return Err(RebuildError::AlreadyInProgress);
            }
            match life.state {
                IndexState::Loading | IndexState::Rebuilding => {
                    log::warn!("rebuild rejected: {:?} already in progress", life.state);
                    return Err(RebuildError::AlreadyInProgress);
                }
                IndexState::Unloaded => {
                    life.state = IndexState::Loading;
                    IndexState::Unloaded
                }
                IndexState::Ready => {
                    life.state = IndexState::Rebuilding;
                    IndexState::Ready
                }
            }
        };

        match self.run_worker(false) {
            Ok(prepared) => self.install(prepared, previous),
            Err(e) => {
                self.fail(previous, &e);
                Err(e)
            }
        }
    }

    /// Run a load or build on a worker thread, bounded by the rebuild
    /// timeout. The worker stages new artifacts but never commits them.
    fn run_worker(&self, prefer_disk: bool) -> Result<Prepared, RebuildError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let cancelled = Arc::new(AtomicBool::new(false));

        let store = Arc::clone(&self.store);
        let files = self.files.clone();
        let worker_cancelled = Arc::clone(&cancelled);
        self.worker_active.store(true, Ordering::SeqCst);
        // Dropped with the closure if the spawn fails
        let slot = WorkerSlot(Arc::clone(&self.worker_active));
        thread::Builder::new()
            .name("facematch-rebuild".to_string())
            .spawn(move || {
                let result = prepare(store.as_ref(), &files, prefer_disk, &worker_cancelled);
                // Free the slot before the caller can see the result
                drop(slot);
                // The receiver is gone if the manager already timed out
                let _ = tx.send(result);
            })
            .map_err(|e| {
                RebuildError::Store(anyhow::Error::new(e).context("spawning rebuild worker"))
            })?;

        match rx.recv_timeout(self.rebuild_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "index build exceeded {:?}, abandoning worker",
                    self.rebuild_timeout
                );
                cancelled.store(true, Ordering::SeqCst);
                Err(RebuildError::TimedOut(self.rebuild_timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(RebuildError::WorkerLost),
        }
    }

    /// Commit staged artifacts, then swap the snapshot pointer.
    fn install(
        &self,
        prepared: Prepared,
        previous: IndexState,
    ) -> Result<RebuildReport, RebuildError> {
        let Prepared {
            snapshot,
            staged,
            skipped,
            duplicates,
            from_disk,
        } = prepared;

        if let Some(staged) = staged {
            if let Err(e) = staged.commit() {
                let e = RebuildError::Resource(e);
                self.fail(previous, &e);
                return Err(e);
            }
        }

        let report = RebuildReport {
            vector_count: snapshot.len(),
            skipped,
            duplicates,
            build_id: snapshot.build_id(),
            built_at: snapshot.built_at(),
            from_disk,
        };

        {
            let mut life = self.lifecycle.lock();
            *self.snapshot.write() = Some(Arc::new(snapshot));
            life.state = IndexState::Ready;
            life.skipped_rows = report.skipped.len();
            life.last_error = None;
        }
        self.settled.notify_all();

        log::info!(
            "index ready: {} vectors, {} skipped, {} duplicate keys (build {}{})",
            report.vector_count,
            report.skipped.len(),
            report.duplicates,
            report.build_id,
            if report.from_disk { ", loaded from disk" } else { "" }
        );
        Ok(report)
    }

    fn fail(&self, previous: IndexState, error: &RebuildError) {
        match previous {
            IndexState::Ready => {
                log::error!("index rebuild failed, keeping previous snapshot: {}", error)
            }
            _ => log::error!("index load failed: {}", error),
        }
        {
            let mut life = self.lifecycle.lock();
            life.state = previous;
            life.last_error = Some(error.to_string());
        }
        self.settled.notify_all();
    }

    fn unavailable_cause(&self) -> String {
        self.lifecycle
            .lock()
            .last_error
            .clone()
            .unwrap_or_else(|| "index not built".to_string())
    }
}

/// Worker body: produce a snapshot either from the persisted pair or from
/// the store, staging fresh artifacts for the latter.
fn prepare(
    store: &dyn EmbeddingRecordStore,
    files: &IndexFiles,
    prefer_disk: bool,
    cancelled: &AtomicBool,
) -> Result<Prepared, RebuildError> {
    if prefer_disk {
        match files.load() {
            Ok(Some(snapshot)) => {
                return Ok(Prepared {
                    snapshot,
                    staged: None,
                    skipped: Vec::new(),
                    duplicates: 0,
                    from_disk: true,
                })
            }
            Ok(None) => log::info!("no persisted index found, building from the embedding store"),
            Err(e) => log::warn!(
                "persisted index unusable, rebuilding from the embedding store: {}",
                e
            ),
        }
    }

    let built = build_snapshot(store, cancelled)?;

    if cancelled.load(Ordering::SeqCst) {
        log::warn!(
            "rebuild finished after its deadline, discarding build {}",
            built.snapshot.build_id()
        );
        return Err(RebuildError::Cancelled);
    }

    let staged = files.stage(&built.snapshot).map_err(RebuildError::Resource)?;
    Ok(Prepared {
        snapshot: built.snapshot,
        staged: Some(staged),
        skipped: built.skipped,
        duplicates: built.duplicates,
        from_disk: false,
    })
}
