pub mod embedding;
pub mod error;
pub mod flat;
pub mod persist;
pub mod snapshot;

// Re-export commonly used types
pub use embedding::{Embedding, EMBEDDING_BYTES, EMBEDDING_DIM};
pub use error::IndexError;
pub use flat::{FlatIndex, Neighbor};
pub use persist::{IndexFiles, StagedFiles};
pub use snapshot::IndexSnapshot;
