use std::io;

use thiserror::Error;
use uuid::Uuid;

/// Errors raised while building, persisting or loading an index.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("embedding has {actual} components, expected {expected}")]
    Dimension { expected: usize, actual: usize },

    #[error("embedding is {actual} bytes long, expected {expected}")]
    ByteLength { expected: usize, actual: usize },

    #[error("embedding contains non-finite components")]
    NonFinite,

    #[error("invalid index file: {0}")]
    InvalidFormat(String),

    #[error("key mapping has {keys} entries but the index holds {vectors} vectors")]
    KeyCountMismatch { vectors: usize, keys: usize },

    #[error("index file and key mapping belong to different builds ({index} vs {keys})")]
    PairMismatch { index: Uuid, keys: Uuid },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("key mapping codec error: {0}")]
    Codec(#[from] postcard::Error),
}
