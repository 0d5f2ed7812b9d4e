use std::time::SystemTime;

use uuid::Uuid;

use crate::{Embedding, FlatIndex, IndexError};

/// One immutable, fully built index together with its key mapping.
///
/// Row `i` of the index corresponds to `keys[i]`. Snapshots are never
/// mutated after construction; a newer build replaces them wholesale.
#[derive(Debug)]
pub struct IndexSnapshot {
    index: FlatIndex,
    keys: Vec<String>,
    build_id: Uuid,
    built_at: SystemTime,
}

impl IndexSnapshot {
    /// Pair a freshly built index with its keys under a new build id.
    pub fn new(index: FlatIndex, keys: Vec<String>) -> Result<Self, IndexError> {
        Self::from_parts(index, keys, Uuid::new_v4(), SystemTime::now())
    }

    pub(crate) fn from_parts(
        index: FlatIndex,
        keys: Vec<String>,
        build_id: Uuid,
        built_at: SystemTime,
    ) -> Result<Self, IndexError> {
        if index.len() != keys.len() {
            return Err(IndexError::KeyCountMismatch {
                vectors: index.len(),
                keys: keys.len(),
            });
        }
        Ok(Self {
            index,
            keys,
            build_id,
            built_at,
        })
    }

    pub fn empty() -> Self {
        Self {
            index: FlatIndex::empty(),
            keys: Vec::new(),
            build_id: Uuid::new_v4(),
            built_at: SystemTime::now(),
        }
    }

    /// Nearest `min(k, len)` keys with their distances, nearest first.
    pub fn search(&self, query: &Embedding, k: usize) -> Vec<(&str, f32)> {
        self.index
            .search(query, k)
            .into_iter()
            .map(|hit| (self.keys[hit.row].as_str(), hit.distance))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn index(&self) -> &FlatIndex {
        &self.index
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn build_id(&self) -> Uuid {
        self.build_id
    }

    pub fn built_at(&self) -> SystemTime {
        self.built_at
    }
}
