//! Distance to similarity percentage.

use serde::{Deserialize, Serialize};

/// Distance at which similarity reaches zero.
pub const DEFAULT_THRESHOLD: f32 = 0.6;

/// Absolute similarity: `clamp(100 * (1 - distance / threshold), 0, 100)`.
///
/// The score of a pair depends only on their distance, so it stays the same
/// across queries and as the corpus grows.
pub fn similarity_percent(distance: f32, threshold: f32) -> f32 {
    if distance.is_nan() || !threshold.is_finite() || threshold <= 0.0 {
        return 0.0;
    }
    (100.0 * (1.0 - distance / threshold)).clamp(0.0, 100.0)
}

/// Legacy per-query min-max normalization: nearest candidate scores 100,
/// farthest 0. A candidate's score changes whenever the pool changes.
pub fn batch_min_max_percent(distances: &[f32]) -> Vec<f32> {
    let finite = distances.iter().copied().filter(|d| d.is_finite());
    let (min, max) = finite.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), d| {
        (lo.min(d), hi.max(d))
    });
    let span = max - min;

    distances
        .iter()
        .map(|&d| {
            if !d.is_finite() {
                0.0
            } else if span <= f32::EPSILON {
                100.0
            } else {
                (100.0 * (max - d) / span).clamp(0.0, 100.0)
            }
        })
        .collect()
}

/// Which formula cards are scored with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scoring {
    #[default]
    FixedThreshold,
    BatchMinMax,
}

#[derive(Debug, Clone, Copy)]
pub struct SimilarityScorer {
    pub scoring: Scoring,
    pub threshold: f32,
}

impl Default for SimilarityScorer {
    fn default() -> Self {
        Self {
            scoring: Scoring::FixedThreshold,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl SimilarityScorer {
    pub fn new(scoring: Scoring, threshold: f32) -> Self {
        Self { scoring, threshold }
    }

    /// Score one result batch; output is parallel to `distances`.
    pub fn score(&self, distances: &[f32]) -> Vec<f32> {
        match self.scoring {
            Scoring::FixedThreshold => distances
                .iter()
                .map(|&d| similarity_percent(d, self.threshold))
                .collect(),
            Scoring::BatchMinMax => batch_min_max_percent(distances),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_threshold_endpoints() {
        for t in [0.3, 0.6, 1.2] {
            assert_eq!(similarity_percent(0.0, t), 100.0);
            assert_eq!(similarity_percent(t, t), 0.0);
            assert_eq!(similarity_percent(t * 1.5, t), 0.0);
            assert_eq!(similarity_percent(t * 100.0, t), 0.0);
        }
    }

    #[test]
    fn test_fixed_threshold_linear() {
        assert!((similarity_percent(0.3, 0.6) - 50.0).abs() < 1e-4);
        assert!((similarity_percent(0.1, 0.6) - 83.333_336).abs() < 1e-3);
    }

    #[test]
    fn test_degenerate_inputs() {
        assert_eq!(similarity_percent(f32::NAN, 0.6), 0.0);
        assert_eq!(similarity_percent(0.1, 0.0), 0.0);
        assert_eq!(similarity_percent(0.1, -1.0), 0.0);
        assert_eq!(similarity_percent(f32::INFINITY, 0.6), 0.0);
    }

    #[test]
    fn test_batch_min_max() {
        let scores = batch_min_max_percent(&[0.2, 0.4, 0.6]);
        assert_eq!(scores[0], 100.0);
        assert!((scores[1] - 50.0).abs() < 1e-3);
        assert_eq!(scores[2], 0.0);
        assert_eq!(batch_min_max_percent(&[0.5, 0.5]), vec![100.0, 100.0]);
        assert!(batch_min_max_percent(&[]).is_empty());
    }

    #[test]
    fn test_batch_scores_drift_with_pool() {
        // Same pair, different pool: the reason the fixed formula is the default
        let alone = batch_min_max_percent(&[0.3, 0.5]);
        let widened = batch_min_max_percent(&[0.1, 0.3, 0.5]);
        assert_ne!(alone[0], widened[1]);

        let scorer = SimilarityScorer::default();
        assert_eq!(scorer.score(&[0.3, 0.5])[0], scorer.score(&[0.1, 0.3, 0.5])[1]);
    }
}
