//! Turning the embedding store into an index snapshot.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use facematch_index::{Embedding, FlatIndex, IndexSnapshot, EMBEDDING_DIM};
use ndarray::Array2;

use crate::error::{PartialDataError, RebuildError};
use crate::record::SourceKind;
use crate::storage::EmbeddingRecordStore;

/// Validated contents of the store, ready to become an index.
#[derive(Debug)]
pub struct CollectedEmbeddings {
    pub keys: Vec<String>,
    pub vectors: Array2<f32>,
    pub skipped: Vec<PartialDataError>,
    pub duplicates: usize,
}

/// Stream every row out of the store, keeping the ones that decode to a
/// valid embedding.
///
/// Malformed rows (wrong byte length, non-finite components, live rows
/// without an owner) are logged and reported but do not fail the
/// collection. Repeated row keys keep their first occurrence.
///
/// `cancelled` is checked before every row is pulled; once it is set the
/// collection stops with `RebuildError::Cancelled`.
pub fn collect_embeddings(
    store: &dyn EmbeddingRecordStore,
    cancelled: &AtomicBool,
) -> Result<CollectedEmbeddings, RebuildError> {
    let mut rows = store.list_embeddings().map_err(RebuildError::Store)?;

    let mut keys = Vec::new();
    let mut values: Vec<f32> = Vec::new();
    let mut seen = HashSet::new();
    let mut skipped = Vec::new();
    let mut duplicates = 0;

    loop {
        if cancelled.load(Ordering::SeqCst) {
            log::warn!(
                "index build abandoned after {} rows",
                keys.len() + skipped.len() + duplicates
            );
            return Err(RebuildError::Cancelled);
        }
        let Some(row) = rows.next() else {
            break;
        };
        let row = row.map_err(RebuildError::Store)?;

        if row.source == SourceKind::LiveUser && row.owner_user_id.is_none() {
            let skip = PartialDataError::new(row.row_key, "live user row has no owner");
            log::warn!("{}", skip);
            skipped.push(skip);
            continue;
        }

        let embedding = match Embedding::from_bytes(&row.embedding) {
            Ok(embedding) => embedding,
            Err(e) => {
                let skip = PartialDataError::new(row.row_key, e.to_string());
                log::warn!("{}", skip);
                skipped.push(skip);
                continue;
            }
        };

        if !seen.insert(row.row_key.clone()) {
            log::warn!("dropping duplicate row key {}", row.row_key);
            duplicates += 1;
            continue;
        }

        values.extend(embedding.vector.iter().copied());
        keys.push(row.row_key.to_string());
    }

    let vectors = Array2::from_shape_vec((keys.len(), EMBEDDING_DIM), values)
        .map_err(|e| RebuildError::Store(anyhow::anyhow!("assembling embedding matrix: {}", e)))?;

    Ok(CollectedEmbeddings {
        keys,
        vectors,
        skipped,
        duplicates,
    })
}

/// Outcome of a successful build, before it is persisted.
#[derive(Debug)]
pub struct BuiltSnapshot {
    pub snapshot: IndexSnapshot,
    pub skipped: Vec<PartialDataError>,
    pub duplicates: usize,
}

pub fn build_snapshot(
    store: &dyn EmbeddingRecordStore,
    cancelled: &AtomicBool,
) -> Result<BuiltSnapshot, RebuildError> {
    let collected = collect_embeddings(store, cancelled)?;
    let index = FlatIndex::build(collected.vectors).map_err(RebuildError::Index)?;
    let snapshot = IndexSnapshot::new(index, collected.keys).map_err(RebuildError::Index)?;
    Ok(BuiltSnapshot {
        snapshot,
        skipped: collected.skipped,
        duplicates: collected.duplicates,
    })
}
