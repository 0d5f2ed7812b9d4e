use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender};
use facematch::config::Config;
use facematch::error::RebuildError;
use facematch::record::FaceIdentity;
use facematch::storage::RowIter;
use facematch::{
    Embedding, EmbeddingRecordStore, EmptyReason, FaceMetadata, FaceRecord, FaceSearch,
    IndexFiles, IndexManager, IndexState, MemoryStore, RowKey, EMBEDDING_DIM,
};
use parking_lot::Mutex;

fn axis(x: f32) -> Vec<f32> {
    let mut v = vec![0.0; EMBEDDING_DIM];
    v[0] = x;
    v
}

fn archival(key: &str, x: f32) -> FaceRecord {
    FaceRecord::archival(
        key,
        Embedding::from_slice(&axis(x)).unwrap().to_bytes(),
        FaceMetadata::default(),
    )
}

/// Store whose next `list_embeddings` call can be held until released.
#[derive(Default)]
struct GatedStore {
    inner: MemoryStore,
    gate: Mutex<Option<Receiver<()>>>,
    failing: AtomicBool,
    pulled: AtomicUsize,
}

impl GatedStore {
    fn with(records: impl IntoIterator<Item = FaceRecord>) -> Self {
        Self {
            inner: MemoryStore::from_records(records),
            ..Default::default()
        }
    }

    /// Hold the next listing until the returned sender fires or is dropped.
    fn arm(&self) -> Sender<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        *self.gate.lock() = Some(rx);
        tx
    }
}

impl EmbeddingRecordStore for GatedStore {
    fn list_embeddings(&self) -> Result<RowIter<'_>> {
        let gate = self.gate.lock().take();
        if let Some(rx) = gate {
            let _ = rx.recv();
        }
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("connection reset by peer");
        }
        let pulled = &self.pulled;
        let rows = self.inner.list_embeddings()?;
        Ok(Box::new(rows.inspect(move |_| {
            pulled.fetch_add(1, Ordering::SeqCst);
        })))
    }

    fn resolve_metadata(&self, row_key: &RowKey) -> Result<Option<FaceIdentity>> {
        self.inner.resolve_metadata(row_key)
    }
}

fn wait_for_state(manager: &IndexManager, state: IndexState) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while manager.state() != state {
        assert!(Instant::now() < deadline, "manager never reached {:?}", state);
        thread::sleep(Duration::from_millis(2));
    }
}

fn wait_for_drain(manager: &IndexManager) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while manager.status().draining {
        assert!(Instant::now() < deadline, "abandoned worker never exited");
        thread::sleep(Duration::from_millis(2));
    }
}

fn keys(manager: &IndexManager, query: f32, k: usize) -> Vec<String> {
    let query = Embedding::from_slice(&axis(query)).unwrap();
    manager
        .search(&query, k)
        .unwrap()
        .into_iter()
        .map(|c| c.row_key.to_string())
        .collect()
}

#[test]
fn test_searches_during_rebuild_see_previous_snapshot() -> Result<()> {
    env_logger::try_init().ok();
    let dir = tempfile::tempdir()?;
    let store = Arc::new(GatedStore::with([
        archival("a", 0.0),
        archival("b", 0.3),
        archival("c", 0.6),
    ]));
    let manager = Arc::new(IndexManager::new(store.clone(), IndexFiles::in_dir(dir.path())));
    assert!(manager.rebuild());
    let before = keys(&manager, 0.1, 2);
    assert_eq!(before, vec!["a", "b"]);

    let release = store.arm();
    let rebuilding = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || manager.try_rebuild())
    };
    wait_for_state(&manager, IndexState::Rebuilding);

    // Lands in the store now, but only the next snapshot will include it
    store.inner.insert(archival("z", 0.1));

    let searches: Vec<_> = (0..10)
        .map(|_| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || keys(&manager, 0.1, 2))
        })
        .collect();
    for search in searches {
        assert_eq!(search.join().unwrap(), before);
    }
    assert_eq!(manager.state(), IndexState::Rebuilding);

    release.send(())?;
    let report = rebuilding.join().unwrap()?;
    assert_eq!(report.vector_count, 4);
    assert_eq!(manager.state(), IndexState::Ready);
    assert_eq!(keys(&manager, 0.1, 2), vec!["z", "a"]);
    Ok(())
}

#[test]
fn test_rebuild_skips_malformed_row() -> Result<()> {
    env_logger::try_init().ok();
    let dir = tempfile::tempdir()?;
    let store = Arc::new(MemoryStore::from_records(
        (0..1000).map(|i| archival(&format!("face-{:04}", i), i as f32 * 0.001)),
    ));
    let mut broken = archival("face-0500", 0.5);
    broken.embedding.truncate(100);
    store.insert(broken);

    let manager = IndexManager::new(store, IndexFiles::in_dir(dir.path()));
    let report = manager.try_rebuild()?;
    assert_eq!(report.vector_count, 999);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].row_key, RowKey::from("face-0500"));
    assert!(report.skipped[0].to_string().contains("face-0500"));

    let status = manager.status();
    assert_eq!(status.vector_count, 999);
    assert_eq!(status.skipped_rows, 1);
    Ok(())
}

#[test]
fn test_second_rebuild_rejected_while_running() -> Result<()> {
    env_logger::try_init().ok();
    let dir = tempfile::tempdir()?;
    let store = Arc::new(GatedStore::with([archival("a", 0.0)]));
    let manager = Arc::new(IndexManager::new(store.clone(), IndexFiles::in_dir(dir.path())));
    assert!(manager.rebuild());

    let release = store.arm();
    let rebuilding = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || manager.try_rebuild())
    };
    wait_for_state(&manager, IndexState::Rebuilding);

    assert!(matches!(manager.try_rebuild(), Err(RebuildError::AlreadyInProgress)));
    assert!(!manager.rebuild());

    drop(release);
    assert!(rebuilding.join().unwrap().is_ok());
    assert!(manager.rebuild());
    Ok(())
}

#[test]
fn test_timed_out_rebuild_keeps_previous_snapshot() -> Result<()> {
    env_logger::try_init().ok();
    let dir = tempfile::tempdir()?;
    let store = Arc::new(GatedStore::with([archival("a", 0.0), archival("b", 0.2)]));
    let manager = IndexManager::new(store.clone(), IndexFiles::in_dir(dir.path()))
        .with_rebuild_timeout(Duration::from_millis(300));
    let first = manager.try_rebuild()?;

    let release = store.arm();
    store.inner.insert(archival("c", 0.1));
    assert!(matches!(manager.try_rebuild(), Err(RebuildError::TimedOut(_))));
    assert_eq!(manager.state(), IndexState::Ready);

    let status = manager.status();
    assert_eq!(status.build_id, Some(first.build_id));
    assert!(status.last_error.is_some());
    assert_eq!(keys(&manager, 0.0, 3), vec!["a", "b"]);

    // The abandoned worker finishes late and must not touch the live pair
    release.send(())?;
    wait_for_drain(&manager);
    let reloaded = IndexManager::new(store.clone(), IndexFiles::in_dir(dir.path()));
    assert!(reloaded.ensure_loaded());
    assert_eq!(reloaded.status().build_id, Some(first.build_id));

    let second = manager.try_rebuild()?;
    assert_eq!(second.vector_count, 3);
    assert!(manager.status().last_error.is_none());
    Ok(())
}

#[test]
fn test_abandoned_rebuild_blocks_new_builds_until_it_exits() -> Result<()> {
    env_logger::try_init().ok();
    let dir = tempfile::tempdir()?;
    let store = Arc::new(GatedStore::with((0..50).map(|i| {
        archival(&format!("face-{:02}", i), i as f32 * 0.01)
    })));
    let manager = IndexManager::new(store.clone(), IndexFiles::in_dir(dir.path()))
        .with_rebuild_timeout(Duration::from_millis(300));
    let first = manager.try_rebuild()?;

    let release = store.arm();
    assert!(matches!(manager.try_rebuild(), Err(RebuildError::TimedOut(_))));
    assert!(manager.status().draining);

    // The abandoned worker still holds the slot, so nothing new may start
    for _ in 0..5 {
        assert!(matches!(manager.try_rebuild(), Err(RebuildError::AlreadyInProgress)));
    }
    assert!(!manager.rebuild());

    let status = manager.status();
    assert_eq!(status.state, IndexState::Ready);
    assert_eq!(status.build_id, Some(first.build_id));
    assert_eq!(keys(&manager, 0.0, 1), vec!["face-00"]);

    let pulled = store.pulled.load(Ordering::SeqCst);
    release.send(())?;
    wait_for_drain(&manager);
    // Cancelled before reading a single row
    assert_eq!(store.pulled.load(Ordering::SeqCst), pulled);
    assert_eq!(manager.status().build_id, Some(first.build_id));

    let second = manager.try_rebuild()?;
    assert_eq!(second.vector_count, 50);
    assert_ne!(second.build_id, first.build_id);
    assert!(!manager.status().draining);
    Ok(())
}

#[test]
fn test_unwritable_index_dir_keeps_serving() -> Result<()> {
    env_logger::try_init().ok();
    let dir = tempfile::tempdir()?;
    let index_dir = dir.path().join("index");
    let store = Arc::new(GatedStore::with([archival("a", 0.0), archival("b", 0.2)]));
    let manager = IndexManager::new(store.clone(), IndexFiles::in_dir(&index_dir));
    let first = manager.try_rebuild()?;

    // A plain file where the index directory should be
    std::fs::remove_dir_all(&index_dir)?;
    std::fs::write(&index_dir, b"")?;
    store.inner.insert(archival("c", 0.1));

    assert!(matches!(manager.try_rebuild(), Err(RebuildError::Resource(_))));
    assert!(!manager.rebuild());

    let status = manager.status();
    assert_eq!(status.state, IndexState::Ready);
    assert_eq!(status.build_id, Some(first.build_id));
    let last_error = status.last_error.unwrap_or_default();
    assert!(last_error.contains("persisting"), "{}", last_error);
    assert_eq!(keys(&manager, 0.0, 5), vec!["a", "b"]);
    Ok(())
}

#[test]
fn test_failed_rebuild_keeps_serving() -> Result<()> {
    env_logger::try_init().ok();
    let dir = tempfile::tempdir()?;
    let store = Arc::new(GatedStore::with([archival("a", 0.0), archival("b", 0.2)]));
    let manager = IndexManager::new(store.clone(), IndexFiles::in_dir(dir.path()));
    let first = manager.try_rebuild()?;

    store.failing.store(true, Ordering::SeqCst);
    assert!(!manager.rebuild());

    let status = manager.status();
    assert_eq!(status.state, IndexState::Ready);
    assert_eq!(status.build_id, Some(first.build_id));
    let last_error = status.last_error.unwrap_or_default();
    assert!(last_error.contains("connection reset"), "{}", last_error);
    assert_eq!(keys(&manager, 0.0, 5), vec!["a", "b"]);
    Ok(())
}

#[test]
fn test_unavailable_index_reports_reason() -> Result<()> {
    env_logger::try_init().ok();
    let dir = tempfile::tempdir()?;
    let store = Arc::new(GatedStore::with([archival("a", 0.0)]));
    store.failing.store(true, Ordering::SeqCst);

    let config = Config {
        data_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    let search = FaceSearch::new(&config, store.clone());

    let outcome = search.search(&axis(0.0), None, None);
    assert!(outcome.is_empty());
    assert_eq!(outcome.reason, Some(EmptyReason::IndexUnavailable));
    assert_eq!(search.status().state, IndexState::Unloaded);

    store.failing.store(false, Ordering::SeqCst);
    let outcome = search.search(&axis(0.0), None, None);
    assert_eq!(outcome.cards.len(), 1);
    assert_eq!(search.status().state, IndexState::Ready);
    Ok(())
}

#[test]
fn test_concurrent_first_searches_share_one_load() -> Result<()> {
    env_logger::try_init().ok();
    let dir = tempfile::tempdir()?;
    let store = Arc::new(GatedStore::with((0..20).map(|i| {
        archival(&format!("face-{:02}", i), i as f32 * 0.01)
    })));
    let manager = Arc::new(IndexManager::new(store.clone(), IndexFiles::in_dir(dir.path())));

    let release = store.arm();
    let searches: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || keys(&manager, 0.0, 1))
        })
        .collect();
    wait_for_state(&manager, IndexState::Loading);
    release.send(())?;

    for search in searches {
        assert_eq!(search.join().unwrap(), vec!["face-00"]);
    }
    let build_id = manager.status().build_id;
    assert!(build_id.is_some());
    assert!(manager.files().is_complete());
    Ok(())
}
