//! Error taxonomy of the match core.
//!
//! Only `RebuildError` ever reaches callers as an `Err`, and only through
//! `IndexManager::try_rebuild`. Input problems and an unavailable index are
//! folded into a typed empty result at the aggregator boundary, skipped rows
//! are collected into the rebuild report.

use std::path::PathBuf;
use std::time::Duration;

use facematch_index::IndexError;
use thiserror::Error;

use crate::matcher::EmptyReason;
use crate::record::RowKey;

/// Problems with the query itself.
#[derive(Error, Debug)]
pub enum InputError {
    #[error("could not read photo {}: {reason}", .path.display())]
    UnreadablePhoto { path: PathBuf, reason: String },

    #[error("no face detected in photo")]
    NoFace,

    #[error("{0} faces detected, expected exactly one")]
    MultipleFaces(usize),

    #[error("invalid query embedding: {0}")]
    InvalidEmbedding(#[from] IndexError),

    #[error("embedding extraction failed: {0}")]
    Extraction(String),
}

/// A malformed row skipped while building an index.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("skipped row {row_key}: {reason}")]
pub struct PartialDataError {
    pub row_key: RowKey,
    pub reason: String,
}

impl PartialDataError {
    pub fn new(row_key: RowKey, reason: impl Into<String>) -> Self {
        Self {
            row_key,
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum RebuildError {
    #[error("a load or rebuild is already in progress")]
    AlreadyInProgress,

    #[error("rebuild did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("rebuild abandoned after its deadline")]
    Cancelled,

    #[error("reading the embedding store failed: {0:#}")]
    Store(anyhow::Error),

    #[error("building the index failed: {0}")]
    Index(IndexError),

    #[error("persisting the index failed: {0}")]
    Resource(IndexError),

    #[error("rebuild worker exited without a result")]
    WorkerLost,
}

/// Recoverable search failures, each mapping onto a user-facing reason.
#[derive(Error, Debug)]
pub enum SearchError {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error("index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("no embedding extractor configured")]
    ExtractorUnavailable,
}

impl SearchError {
    pub fn reason(&self) -> EmptyReason {
        match self {
            SearchError::Input(_) => EmptyReason::NoFaceDetected,
            SearchError::IndexUnavailable(_) | SearchError::ExtractorUnavailable => {
                EmptyReason::IndexUnavailable
            }
        }
    }
}
