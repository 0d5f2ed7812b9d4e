use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::RwLock;

use crate::record::{FaceIdentity, FaceRecord, RawEmbeddingRow, RowKey, SourceKind, UserId};

pub type RowIter<'a> = Box<dyn Iterator<Item = Result<RawEmbeddingRow>> + 'a>;

/// Read side of the embedding store used by the match core.
///
/// Archival and live-user rows come through the same two calls: a full
/// stream for index building and a point lookup that resolves a row key to
/// its identity. Writes are the caller's business.
pub trait EmbeddingRecordStore: Send + Sync {
    /// Stream every row of both sources. An `Err` item aborts the stream;
    /// malformed embeddings are yielded as-is and filtered by the rebuild.
    fn list_embeddings(&self) -> Result<RowIter<'_>>;

    /// Resolve one row. `Ok(None)` when the row no longer exists.
    fn resolve_metadata(&self, row_key: &RowKey) -> Result<Option<FaceIdentity>>;
}

/// In-process store keyed by row key.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<RowKey, FaceRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = FaceRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.insert(record);
        }
        store
    }

    /// Insert or replace a row, returning the replaced one.
    pub fn insert(&self, record: FaceRecord) -> Option<FaceRecord> {
        self.records.write().insert(record.row_key.clone(), record)
    }

    pub fn remove(&self, row_key: &RowKey) -> Option<FaceRecord> {
        self.records.write().remove(row_key)
    }

    pub fn get(&self, row_key: &RowKey) -> Option<FaceRecord> {
        self.records.read().get(row_key).cloned()
    }

    /// Mark an archival row as claimed by `user`.
    pub fn claim(&self, row_key: &RowKey, user: UserId) -> Result<()> {
        let mut records = self.records.write();
        let record = records
            .get_mut(row_key)
            .with_context(|| format!("no face row {}", row_key))?;
        if record.source != SourceKind::Archival {
            anyhow::bail!("row {} is a live user row and cannot be claimed", row_key);
        }
        if let Some(existing) = record.owner_user_id {
            if existing != user {
                anyhow::bail!("row {} is already claimed by user {}", row_key, existing);
            }
        }
        record.owner_user_id = Some(user);
        Ok(())
    }

    pub fn records(&self) -> Vec<FaceRecord> {
        self.records.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl EmbeddingRecordStore for MemoryStore {
    fn list_embeddings(&self) -> Result<RowIter<'_>> {
        // Copy out so the stream does not hold the lock while the index builds
        let rows: Vec<RawEmbeddingRow> = self
            .records
            .read()
            .values()
            .map(FaceRecord::raw_row)
            .collect();
        Ok(Box::new(rows.into_iter().map(Ok)))
    }

    fn resolve_metadata(&self, row_key: &RowKey) -> Result<Option<FaceIdentity>> {
        match self.records.read().get(row_key) {
            Some(record) => Ok(Some(record.identity()?)),
            None => Ok(None),
        }
    }
}

/// Store persisted as a single postcard file, held in memory once opened.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    inner: MemoryStore,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let records = load_records(&path)?;
        log::debug!("loaded {} face rows from {}", records.len(), path.display());
        Ok(Self {
            path,
            inner: MemoryStore::from_records(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, row_key: &RowKey) -> Option<FaceRecord> {
        self.inner.get(row_key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Insert or replace a row and write the store back.
    pub fn save_record(&self, record: FaceRecord) -> Result<()> {
        let row_key = record.row_key.clone();
        let previous = self.inner.insert(record);
        if let Err(e) = self.flush() {
            // Keep memory in line with disk
            match previous {
                Some(previous) => {
                    self.inner.insert(previous);
                }
                None => {
                    self.inner.remove(&row_key);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    pub fn claim(&self, row_key: &RowKey, user: UserId) -> Result<()> {
        let previous = self.inner.get(row_key);
        self.inner.claim(row_key, user)?;
        if let Err(e) = self.flush() {
            if let Some(previous) = previous {
                self.inner.insert(previous);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Remove a row. Returns false if it did not exist.
    pub fn purge(&self, row_key: &RowKey) -> Result<bool> {
        let Some(previous) = self.inner.remove(row_key) else {
            return Ok(false);
        };
        if let Err(e) = self.flush() {
            self.inner.insert(previous);
            return Err(e);
        }
        Ok(true)
    }

    fn flush(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let data = postcard::to_allocvec(&self.inner.records())?;
        let tmp = self.path.with_extension("bin.tmp");
        std::fs::write(&tmp, data).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

impl EmbeddingRecordStore for FileStore {
    fn list_embeddings(&self) -> Result<RowIter<'_>> {
        self.inner.list_embeddings()
    }

    fn resolve_metadata(&self, row_key: &RowKey) -> Result<Option<FaceIdentity>> {
        self.inner.resolve_metadata(row_key)
    }
}

pub fn load_records(path: &Path) -> Result<Vec<FaceRecord>> {
    if !path.exists() {
        return Ok(vec![]);
    }

    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    postcard::from_bytes(&data).with_context(|| format!("decoding {}", path.display()))
}
