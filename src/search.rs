//! Entry point for the API layer.
//!
//! `FaceSearch` wires the store, the index manager and the aggregator
//! together and turns every recoverable failure into a typed empty result.

use std::path::Path;
use std::sync::Arc;

use facematch_index::{Embedding, IndexFiles};
use image::DynamicImage;

use crate::config::Config;
use crate::error::{InputError, RebuildError, SearchError};
use crate::manager::{IndexManager, IndexStatus, RebuildReport};
use crate::matcher::{MatchAggregator, MatchOutcome, MatchRequest};
use crate::record::RowKey;
use crate::scorer::{Scoring, SimilarityScorer};
use crate::storage::EmbeddingRecordStore;

/// External face embedding extractor.
///
/// Implementations return `InputError::NoFace` or
/// `InputError::MultipleFaces` when the photo does not contain exactly one
/// usable face.
pub trait EmbeddingExtractor: Send + Sync {
    fn extract_embedding(&self, photo: &DynamicImage) -> Result<Embedding, InputError>;
}

pub struct FaceSearch {
    manager: Arc<IndexManager>,
    aggregator: MatchAggregator,
    extractor: Option<Arc<dyn EmbeddingExtractor>>,
    top_k: usize,
    candidate_pool: usize,
}

impl FaceSearch {
    pub fn new(config: &Config, store: Arc<dyn EmbeddingRecordStore>) -> Self {
        let manager = Arc::new(
            IndexManager::new(Arc::clone(&store), IndexFiles::in_dir(config.index_dir()))
                .with_rebuild_timeout(config.rebuild_timeout()),
        );
        Self::with_manager(config, manager, store)
    }

    /// Build around an existing manager, e.g. one shared with a background
    /// rebuild scheduler.
    pub fn with_manager(
        config: &Config,
        manager: Arc<IndexManager>,
        store: Arc<dyn EmbeddingRecordStore>,
    ) -> Self {
        if config.scoring == Scoring::BatchMinMax {
            log::warn!(
                "batch min-max scoring is enabled; similarity percentages will vary between queries"
            );
        }
        let scorer = SimilarityScorer::new(config.scoring, config.threshold);
        Self {
            aggregator: MatchAggregator::new(Arc::clone(&manager), store, scorer),
            manager,
            extractor: None,
            top_k: config.top_k,
            candidate_pool: config.candidate_pool,
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn EmbeddingExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn manager(&self) -> &Arc<IndexManager> {
        &self.manager
    }

    /// Request with the configured defaults; `k` falls back to the candidate
    /// pool size.
    pub fn request(&self, k: Option<usize>) -> MatchRequest {
        MatchRequest::new(k.unwrap_or(self.candidate_pool)).top_k(self.top_k)
    }

    /// Search with a raw query embedding.
    pub fn search(
        &self,
        query: &[f32],
        k: Option<usize>,
        exclude: Option<&RowKey>,
    ) -> MatchOutcome {
        let mut request = self.request(k);
        request.exclude = exclude.cloned();
        self.search_with(query, &request)
    }

    pub fn search_with(&self, query: &[f32], request: &MatchRequest) -> MatchOutcome {
        match Embedding::from_slice(query) {
            Ok(embedding) => self.aggregator.aggregate(&embedding, request),
            Err(e) => reject(SearchError::Input(InputError::InvalidEmbedding(e))),
        }
    }

    /// Decode a photo, extract its face embedding and search with it.
    pub fn search_photo(&self, photo: &Path, request: &MatchRequest) -> MatchOutcome {
        let Some(extractor) = self.extractor.as_ref() else {
            return reject(SearchError::ExtractorUnavailable);
        };

        let image = match image::open(photo) {
            Ok(image) => image,
            Err(e) => {
                return reject(SearchError::Input(InputError::UnreadablePhoto {
                    path: photo.to_path_buf(),
                    reason: e.to_string(),
                }))
            }
        };

        match extractor.extract_embedding(&image) {
            Ok(embedding) => self.aggregator.aggregate(&embedding, request),
            Err(e) => reject(SearchError::Input(e)),
        }
    }

    pub fn rebuild(&self) -> bool {
        self.manager.rebuild()
    }

    pub fn try_rebuild(&self) -> Result<RebuildReport, RebuildError> {
        self.manager.try_rebuild()
    }

    pub fn status(&self) -> IndexStatus {
        self.manager.status()
    }
}

fn reject(error: SearchError) -> MatchOutcome {
    log::info!("search rejected: {}", error);
    MatchOutcome::empty(error.reason())
}
