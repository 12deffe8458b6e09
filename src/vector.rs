//! Unit-vector validation and similarity helpers.
//!
//! Similarity throughout the engine is the inner product, which equals cosine
//! similarity only for L2-normalized inputs. Every vector that enters the
//! store or a query path passes through [`validate_unit`] first, so index
//! implementations are free to use the fast `dot` path.

use crate::error::{EngineError, Result};
use crate::simd;

/// Inner-product similarity for unit vectors.
///
/// Returns nonsense if inputs are not normalized; callers are expected to
/// validate with [`validate_unit`] at the boundary.
#[inline]
#[must_use]
pub fn similarity(a: &[f32], b: &[f32]) -> f32 {
    simd::dot(a, b)
}

/// Normalize a vector to unit L2 norm.
///
/// A near-zero vector cannot be normalized and is returned as an error
/// rather than a zero vector, which would silently match nothing.
pub fn normalize(v: &[f32]) -> Result<Vec<f32>> {
    let n = simd::norm(v);
    if !n.is_finite() || n < 1e-10 {
        return Err(EngineError::InvalidVector(format!(
            "cannot normalize vector with norm {n}"
        )));
    }
    Ok(v.iter().map(|x| x / n).collect())
}

/// Check that `v` has the expected dimension and unit norm within `epsilon`.
pub fn validate_unit(v: &[f32], dimension: usize, epsilon: f32) -> Result<()> {
    if v.len() != dimension {
        return Err(EngineError::DimensionMismatch {
            expected: dimension,
            actual: v.len(),
        });
    }
    let n = simd::norm(v);
    if !n.is_finite() {
        return Err(EngineError::InvalidVector("non-finite norm".to_string()));
    }
    if (n - 1.0).abs() > epsilon {
        return Err(EngineError::InvalidVector(format!(
            "norm {n} deviates from 1 by more than {epsilon}"
        )));
    }
    Ok(())
}
