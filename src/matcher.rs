//! Turning raw nearest-neighbor hits into a ranked, deduplicated card list.

use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use facematch_index::Embedding;
use serde::Serialize;

use crate::manager::{IndexManager, MatchCandidate};
use crate::record::{ClaimStatus, DedupKey, FaceIdentity, RowKey, SourceKind, UserId};
use crate::scorer::SimilarityScorer;
use crate::storage::EmbeddingRecordStore;

pub const DEFAULT_TOP_K: usize = 50;

#[derive(Debug, Clone)]
pub struct MatchRequest {
    /// Nearest neighbors to fetch from the index.
    pub k: usize,
    /// Maximum number of cards returned.
    pub top_k: usize,
    /// Row that must never match itself, typically the querying user's own.
    pub exclude: Option<RowKey>,
    /// Rows the caller has already liked; annotation only.
    pub liked: HashSet<RowKey>,
}

impl MatchRequest {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            top_k: DEFAULT_TOP_K,
            exclude: None,
            liked: HashSet::new(),
        }
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn excluding(mut self, row_key: impl Into<RowKey>) -> Self {
        self.exclude = Some(row_key.into());
        self
    }

    pub fn liked(mut self, liked: impl IntoIterator<Item = RowKey>) -> Self {
        self.liked.extend(liked);
        self
    }
}

/// Why a search came back empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyReason {
    NoFaceDetected,
    NoSimilarFaces,
    IndexUnavailable,
}

impl EmptyReason {
    pub fn message(self) -> &'static str {
        match self {
            EmptyReason::NoFaceDetected => "no face detected in your photo",
            EmptyReason::NoSimilarFaces => "no similar faces found",
            EmptyReason::IndexUnavailable => "search temporarily unavailable",
        }
    }
}

impl fmt::Display for EmptyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchCard {
    pub row_key: RowKey,
    pub dedup_key: DedupKey,
    pub display_name: String,
    pub era: Option<String>,
    pub region: Option<String>,
    pub source: SourceKind,
    /// The face belongs to a platform account, directly or through a claim.
    pub is_registered: bool,
    /// Claim state of archival faces; `None` for live profiles.
    pub claim: Option<ClaimStatus>,
    pub owner_user_id: Option<UserId>,
    pub similarity: f32,
    pub distance: f32,
    pub liked: bool,
}

/// Cards plus, when there are none, the reason why.
#[derive(Debug, Clone, Serialize)]
pub struct MatchOutcome {
    pub cards: Vec<MatchCard>,
    pub reason: Option<EmptyReason>,
}

impl MatchOutcome {
    pub fn empty(reason: EmptyReason) -> Self {
        Self {
            cards: Vec::new(),
            reason: Some(reason),
        }
    }

    pub fn from_cards(cards: Vec<MatchCard>) -> Self {
        let reason = cards.is_empty().then_some(EmptyReason::NoSimilarFaces);
        Self { cards, reason }
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

#[derive(Debug)]
struct Scored {
    row_key: RowKey,
    key: DedupKey,
    distance: f32,
    similarity: f32,
    identity: FaceIdentity,
}

impl Scored {
    /// Higher similarity wins, then lower distance, then lower row key.
    fn outranks(&self, other: &Scored) -> bool {
        match self.similarity.total_cmp(&other.similarity) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => match self.distance.total_cmp(&other.distance) {
                Ordering::Less => true,
                Ordering::Greater => false,
                Ordering::Equal => self.row_key < other.row_key,
            },
        }
    }

    fn into_card(self, liked: &HashSet<RowKey>) -> MatchCard {
        let liked = liked.contains(&self.row_key);
        let (source, is_registered, claim, owner_user_id, metadata) = match self.identity {
            FaceIdentity::Archival { metadata, claim } => (
                SourceKind::Archival,
                claim.claimant().is_some(),
                Some(claim),
                claim.claimant(),
                metadata,
            ),
            FaceIdentity::LiveUser { user_id, metadata } => {
                (SourceKind::LiveUser, true, None, Some(user_id), metadata)
            }
        };
        MatchCard {
            row_key: self.row_key,
            dedup_key: self.key,
            display_name: metadata.display_name,
            era: metadata.era,
            region: metadata.region,
            source,
            is_registered,
            claim,
            owner_user_id,
            similarity: self.similarity,
            distance: self.distance,
            liked,
        }
    }
}

pub struct MatchAggregator {
    manager: Arc<IndexManager>,
    store: Arc<dyn EmbeddingRecordStore>,
    scorer: SimilarityScorer,
}

impl MatchAggregator {
    pub fn new(
        manager: Arc<IndexManager>,
        store: Arc<dyn EmbeddingRecordStore>,
        scorer: SimilarityScorer,
    ) -> Self {
        Self {
            manager,
            store,
            scorer,
        }
    }

    pub fn scorer(&self) -> &SimilarityScorer {
        &self.scorer
    }

    /// Search, resolve, score, deduplicate, rank and truncate.
    pub fn aggregate(&self, query: &Embedding, request: &MatchRequest) -> MatchOutcome {
        // One extra so dropping the excluded row still leaves k candidates
        let fetch = match request.exclude {
            Some(_) => request.k.saturating_add(1),
            None => request.k,
        };

        let candidates = match self.manager.search(query, fetch) {
            Ok(candidates) => candidates,
            Err(e) => {
                log::warn!("search failed: {}", e);
                return MatchOutcome::empty(e.reason());
            }
        };
        let fetched = candidates.len();

        let resolved = self.resolve(candidates, request.exclude.as_ref());
        let distances: Vec<f32> = resolved.iter().map(|(_, distance, _)| *distance).collect();
        let scores = self.scorer.score(&distances);

        let scored = resolved
            .into_iter()
            .zip(scores)
            .map(|((row_key, distance, identity), similarity)| Scored {
                key: identity.dedup_key(&row_key),
                row_key,
                distance,
                similarity,
                identity,
            })
            .collect();

        let ranked = dedup_and_rank(scored, request.k.min(request.top_k));
        log::debug!(
            "search: {} candidates fetched, {} cards after dedup",
            fetched,
            ranked.len()
        );

        MatchOutcome::from_cards(
            ranked
                .into_iter()
                .map(|entry| entry.into_card(&request.liked))
                .collect(),
        )
    }

    fn resolve(
        &self,
        candidates: Vec<MatchCandidate>,
        exclude: Option<&RowKey>,
    ) -> Vec<(RowKey, f32, FaceIdentity)> {
        candidates
            .into_iter()
            .filter(|c| Some(&c.row_key) != exclude)
            .filter_map(
                |MatchCandidate { row_key, distance }| match self.store.resolve_metadata(&row_key) {
                    Ok(Some(identity)) => Some((row_key, distance, identity)),
                    Ok(None) => {
                        log::debug!("row {} no longer in the store, dropping candidate", row_key);
                        None
                    }
                    Err(e) => {
                        log::warn!("resolving row {} failed, dropping candidate: {:#}", row_key, e);
                        None
                    }
                },
            )
            .collect()
    }
}

/// Keep the best entry per dedup key, order by similarity (ties by row key)
/// and cut to `limit`.
fn dedup_and_rank(scored: Vec<Scored>, limit: usize) -> Vec<Scored> {
    let mut best: HashMap<DedupKey, Scored> = HashMap::with_capacity(scored.len());
    for entry in scored {
        match best.entry(entry.key.clone()) {
            Entry::Occupied(mut slot) => {
                if entry.outranks(slot.get()) {
                    slot.insert(entry);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
        }
    }

    let mut survivors: Vec<Scored> = best.into_values().collect();
    survivors.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| a.row_key.cmp(&b.row_key))
    });
    survivors.truncate(limit);
    survivors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::FaceMetadata;

    fn entry(row: &str, identity: FaceIdentity, distance: f32) -> Scored {
        let row_key = RowKey::from(row);
        Scored {
            key: identity.dedup_key(&row_key),
            row_key,
            distance,
            similarity: crate::scorer::similarity_percent(distance, 0.6),
            identity,
        }
    }

    fn archival(claimed_by: Option<u64>) -> FaceIdentity {
        FaceIdentity::Archival {
            metadata: FaceMetadata::default(),
            claim: match claimed_by {
                Some(id) => ClaimStatus::Claimed { by: UserId(id) },
                None => ClaimStatus::Unclaimed,
            },
        }
    }

    fn live(id: u64) -> FaceIdentity {
        FaceIdentity::LiveUser {
            user_id: UserId(id),
            metadata: FaceMetadata::default(),
        }
    }

    #[test]
    fn test_claimed_archival_merges_with_live_profile() {
        let ranked = dedup_and_rank(
            vec![
                entry("L42", live(42), 0.2),
                entry("F1", archival(Some(42)), 0.1),
                entry("F2", archival(None), 0.3),
            ],
            50,
        );
        let rows: Vec<&str> = ranked.iter().map(|s| s.row_key.as_str()).collect();
        assert_eq!(rows, vec!["F1", "F2"]);
        assert_eq!(ranked[0].key.to_string(), "user:42");
    }

    #[test]
    fn test_equal_similarity_orders_by_row_key() {
        // Both beyond the threshold, so both score zero
        let ranked = dedup_and_rank(
            vec![
                entry("b", archival(None), 0.9),
                entry("a", archival(None), 1.5),
                entry("c", archival(None), 0.1),
            ],
            50,
        );
        let rows: Vec<&str> = ranked.iter().map(|s| s.row_key.as_str()).collect();
        assert_eq!(rows, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_collision_at_equal_similarity_prefers_nearer() {
        let ranked = dedup_and_rank(
            vec![entry("L7", live(7), 0.9), entry("F7", archival(Some(7)), 0.7)],
            50,
        );
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].row_key.as_str(), "F7");
    }

    #[test]
    fn test_truncates_to_limit() {
        let scored = (0..10)
            .map(|i| entry(&format!("f{}", i), archival(None), i as f32 * 0.05))
            .collect();
        assert_eq!(dedup_and_rank(scored, 3).len(), 3);
    }

    #[test]
    fn test_card_fields() {
        let liked: HashSet<RowKey> = [RowKey::from("F1")].into_iter().collect();

        let card = entry("F1", archival(Some(9)), 0.0).into_card(&liked);
        assert!(card.is_registered);
        assert!(card.liked);
        assert_eq!(card.owner_user_id, Some(UserId(9)));
        assert_eq!(card.claim, Some(ClaimStatus::Claimed { by: UserId(9) }));
        assert_eq!(card.similarity, 100.0);

        let card = entry("F2", archival(None), 0.3).into_card(&liked);
        assert!(!card.is_registered);
        assert!(!card.liked);
        assert_eq!(card.dedup_key.to_string(), "face:F2");

        let card = entry("L3", live(3), 0.3).into_card(&liked);
        assert!(card.is_registered);
        assert_eq!(card.claim, None);
        assert_eq!(card.source, SourceKind::LiveUser);
    }

    #[test]
    fn test_outcome_reasons() {
        assert_eq!(
            MatchOutcome::from_cards(vec![]).reason,
            Some(EmptyReason::NoSimilarFaces)
        );
        assert_ne!(
            EmptyReason::NoFaceDetected.message(),
            EmptyReason::IndexUnavailable.message()
        );
    }
}
