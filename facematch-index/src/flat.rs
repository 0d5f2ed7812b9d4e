//! Exact nearest-neighbor search over a dense embedding matrix.
//!
//! There is no training or quantization step: `build` takes ownership of the
//! `N x EMBEDDING_DIM` matrix and `search` scans every row. Memory is the
//! matrix itself, search is O(N * EMBEDDING_DIM).

use std::cmp::Ordering;

use ndarray::{Array2, ArrayView2};

use crate::embedding::l2_distance;
use crate::{Embedding, IndexError, EMBEDDING_DIM};

/// One search hit: matrix row and its Euclidean distance to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub row: usize,
    pub distance: f32,
}

impl Neighbor {
    /// Nearest first; equal distances fall back to the lower row.
    fn cmp_nearest(a: &Neighbor, b: &Neighbor) -> Ordering {
        a.distance
            .total_cmp(&b.distance)
            .then_with(|| a.row.cmp(&b.row))
    }
}

/// Flat (brute force) L2 index.
#[derive(Debug, Clone)]
pub struct FlatIndex {
    vectors: Array2<f32>,
}

impl FlatIndex {
    pub fn build(vectors: Array2<f32>) -> Result<Self, IndexError> {
        if vectors.ncols() != EMBEDDING_DIM {
            return Err(IndexError::Dimension {
                expected: EMBEDDING_DIM,
                actual: vectors.ncols(),
            });
        }
        if vectors.iter().any(|v| !v.is_finite()) {
            return Err(IndexError::NonFinite);
        }
        let vectors = if vectors.is_standard_layout() {
            vectors
        } else {
            vectors.as_standard_layout().into_owned()
        };
        log::debug!("built flat index with {} vectors", vectors.nrows());
        Ok(Self { vectors })
    }

    pub fn empty() -> Self {
        Self {
            vectors: Array2::zeros((0, EMBEDDING_DIM)),
        }
    }

    pub fn len(&self) -> usize {
        self.vectors.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn vectors(&self) -> ArrayView2<'_, f32> {
        self.vectors.view()
    }

    /// Return the `min(k, len)` nearest rows ordered by non-decreasing
    /// distance.
    pub fn search(&self, query: &Embedding, k: usize) -> Vec<Neighbor> {
        let n = self.len();
        if k == 0 || n == 0 {
            return Vec::new();
        }

        let query = query.view();
        let mut hits: Vec<Neighbor> = self
            .vectors
            .outer_iter()
            .enumerate()
            .map(|(row, v)| Neighbor {
                row,
                distance: l2_distance(v, query),
            })
            .collect();

        let k = k.min(n);
        if k < n {
            // Partition so the k nearest occupy the front, then only sort those
            hits.select_nth_unstable_by(k - 1, Neighbor::cmp_nearest);
            hits.truncate(k);
        }
        hits.sort_unstable_by(Neighbor::cmp_nearest);
        hits
    }
}
