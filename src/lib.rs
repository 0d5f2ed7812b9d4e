pub mod config;
pub mod error;
pub mod manager;
pub mod matcher;
pub mod rebuild;
pub mod record;
pub mod scorer;
pub mod search;
pub mod storage;

// Re-export engine types for convenience
pub use facematch_index::{Embedding, IndexFiles, IndexSnapshot, EMBEDDING_DIM};

pub use manager::{IndexManager, IndexState, IndexStatus, MatchCandidate, RebuildReport};
pub use matcher::{EmptyReason, MatchAggregator, MatchCard, MatchOutcome, MatchRequest};
pub use record::{DedupKey, FaceIdentity, FaceMetadata, FaceRecord, RowKey, SourceKind, UserId};
pub use search::{EmbeddingExtractor, FaceSearch};
pub use storage::{EmbeddingRecordStore, FileStore, MemoryStore};
