//! Distance and similarity between embedding vectors.
//!
//! Every function here refuses to compare vectors of different length:
//! a mismatch means the gallery was enrolled with a different model.

use crate::types::Embedding;
use thiserror::Error;

/// Added to each vector norm before dividing, so an all-zero vector
/// normalizes to zero instead of NaN.
pub const NORM_EPSILON: f32 = 1e-8;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("embedding dimension mismatch: expected {expected}, got {actual}")]
pub struct DimensionMismatch {
    pub expected: usize,
    pub actual: usize,
}

fn check_dims(a: &[f32], b: &[f32]) -> Result<(), DimensionMismatch> {
    if a.len() != b.len() {
        return Err(DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }
    Ok(())
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Euclidean (L2) distance. Lower = more similar.
pub fn distance(a: &[f32], b: &[f32]) -> Result<f32, DimensionMismatch> {
    check_dims(a, b)?;
    Ok(a
        .iter()
        .zip(b)
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt())
}

/// Raw cosine similarity in [-1, 1], with epsilon-guarded normalization.
pub fn cosine(a: &[f32], b: &[f32]) -> Result<f32, DimensionMismatch> {
    check_dims(a, b)?;
    let na = norm(a) + NORM_EPSILON;
    let nb = norm(b) + NORM_EPSILON;

    // Per-element products of normalized components; multiplication is
    // commutative in IEEE arithmetic, so swapping a and b is bit-identical.
    Ok(a.iter().zip(b).map(|(x, y)| (x / na) * (y / nb)).sum())
}

/// Cosine similarity rescaled from [-1, 1] into [0, 1] via `(cos + 1) / 2`.
/// Higher = more similar.
pub fn similarity(a: &[f32], b: &[f32]) -> Result<f32, DimensionMismatch> {
    Ok((cosine(a, b)? + 1.0) / 2.0)
}

/// Scale `values` to unit L2 norm in place. Zero vectors are left untouched.
pub fn l2_normalize(values: &mut [f32]) {
    let n = norm(values);
    if n > 0.0 {
        values.iter_mut().for_each(|x| *x /= n);
    }
}

impl Embedding {
    /// Rescaled cosine similarity in [0, 1]. See [`similarity`].
    pub fn similarity(&self, other: &Embedding) -> Result<f32, DimensionMismatch> {
        similarity(&self.values, &other.values)
    }

    /// Raw cosine similarity in [-1, 1].
    pub fn cosine(&self, other: &Embedding) -> Result<f32, DimensionMismatch> {
        cosine(&self.values, &other.values)
    }

    /// Euclidean distance between two embeddings.
    pub fn distance(&self, other: &Embedding) -> Result<f32, DimensionMismatch> {
        distance(&self.values, &other.values)
    }
}
