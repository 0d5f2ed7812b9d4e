use ndarray::{Array1, ArrayView1};

use crate::IndexError;

/// Number of components in a face embedding.
pub const EMBEDDING_DIM: usize = 128;

/// Encoded size of one embedding in the record store.
pub const EMBEDDING_BYTES: usize = EMBEDDING_DIM * std::mem::size_of::<f32>();

/// Face embedding as produced by the external extractor.
///
/// Construction validates the dimension and rejects NaN/infinite components,
/// so every `Embedding` in circulation can be indexed and searched.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Array1<f32>,
}

impl Embedding {
    pub fn from_vec(values: Vec<f32>) -> Result<Self, IndexError> {
        if values.len() != EMBEDDING_DIM {
            return Err(IndexError::Dimension {
                expected: EMBEDDING_DIM,
                actual: values.len(),
            });
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(IndexError::NonFinite);
        }
        Ok(Self {
            vector: Array1::from_vec(values),
        })
    }

    pub fn from_slice(values: &[f32]) -> Result<Self, IndexError> {
        Self::from_vec(values.to_vec())
    }

    /// Decode the byte layout the record store keeps embeddings in
    /// (`EMBEDDING_DIM` f32 values, host byte order).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IndexError> {
        if bytes.len() != EMBEDDING_BYTES {
            return Err(IndexError::ByteLength {
                expected: EMBEDDING_BYTES,
                actual: bytes.len(),
            });
        }
        let mut values = vec![0.0f32; EMBEDDING_DIM];
        // Copy into an f32 buffer so the source slice needs no alignment
        bytemuck::cast_slice_mut::<f32, u8>(&mut values).copy_from_slice(bytes);
        Self::from_vec(values)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let values = self.vector.to_vec();
        bytemuck::cast_slice::<f32, u8>(&values).to_vec()
    }

    pub fn view(&self) -> ArrayView1<'_, f32> {
        self.vector.view()
    }

    /// Euclidean distance to another embedding.
    pub fn distance(&self, other: &Embedding) -> f32 {
        l2_distance(self.view(), other.view())
    }
}

/// Euclidean (not squared) distance between two equally sized vectors.
pub fn l2_distance(a: ArrayView1<'_, f32>, b: ArrayView1<'_, f32>) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum::<f32>()
        .sqrt()
}
