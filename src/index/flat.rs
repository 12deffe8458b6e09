//! Brute-force exact index: inner-product scan over SoA storage.
//!
//! Insert is an O(1) amortized append; search is O(n·d). Exact results make
//! this the default for small and medium galleries, and the reference
//! against which IVF-PQ recall is judged.

use crate::error::{EngineError, Result};
use crate::index::{check_deadline, validate_k, Deadline, VectorId, VectorIndex};
use crate::simd;

/// How many vectors to scan between deadline checks.
const DEADLINE_STRIDE: usize = 1024;

/// Exact inner-product index.
#[derive(Debug)]
pub struct FlatIndex {
    /// SoA storage: vector `i` occupies `[i * dimension, (i + 1) * dimension)`.
    vectors: Vec<f32>,
    dimension: usize,
    num_vectors: usize,
}

impl FlatIndex {
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(EngineError::InvalidArgument(
                "dimension must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            vectors: Vec::new(),
            dimension,
            num_vectors: 0,
        })
    }

    fn get_vector(&self, idx: usize) -> &[f32] {
        let start = idx * self.dimension;
        &self.vectors[start..start + self.dimension]
    }
}

impl VectorIndex for FlatIndex {
    fn insert_one(&mut self, vector: &[f32]) -> Result<VectorId> {
        if vector.len() != self.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        let id = self.num_vectors as VectorId;
        self.vectors.extend_from_slice(vector);
        self.num_vectors += 1;
        Ok(id)
    }

    fn search_top_k(
        &self,
        query: &[f32],
        k: usize,
        deadline: Option<Deadline>,
    ) -> Result<Vec<(VectorId, f32)>> {
        validate_k(k)?;
        if query.len() != self.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if self.num_vectors == 0 {
            return Ok(Vec::new());
        }
        check_deadline(deadline)?;

        let mut scored: Vec<(VectorId, f32)> = Vec::with_capacity(self.num_vectors);
        for idx in 0..self.num_vectors {
            if idx % DEADLINE_STRIDE == 0 && idx > 0 {
                check_deadline(deadline)?;
            }
            let sim = simd::dot(query, self.get_vector(idx));
            scored.push((idx as VectorId, sim));
        }

        // Descending similarity; ties broken by lowest id (earliest inserted).
        scored.sort_unstable_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }

    fn needs_retrain(&self) -> bool {
        false
    }

    fn len(&self) -> usize {
        self.num_vectors
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::normalize;
    use std::time::Instant;

    fn unit(v: &[f32]) -> Vec<f32> {
        normalize(v).unwrap()
    }

    #[test]
    fn search_returns_exact_top_k_descending() {
        let mut index = FlatIndex::new(2).unwrap();
        let a = unit(&[1.0, 0.0]);
        let b = unit(&[0.8, 0.6]);
        let c = unit(&[0.0, 1.0]);
        index.insert_one(&a).unwrap();
        index.insert_one(&b).unwrap();
        index.insert_one(&c).unwrap();

        let results = index.search_top_k(&a, 3, None).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, 0);
        assert!((results[0].1 - 1.0).abs() < 1e-5);
        for pair in results.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
    }

    #[test]
    fn ties_broken_by_earliest_inserted() {
        let mut index = FlatIndex::new(2).unwrap();
        let v = unit(&[1.0, 0.0]);
        index.insert_one(&v).unwrap();
        index.insert_one(&v).unwrap();
        index.insert_one(&v).unwrap();

        let results = index.search_top_k(&v, 3, None).unwrap();
        assert_eq!(
            results.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn empty_index_returns_empty_not_error() {
        let index = FlatIndex::new(4).unwrap();
        let q = unit(&[1.0, 0.0, 0.0, 0.0]);
        assert!(index.search_top_k(&q, 5, None).unwrap().is_empty());
    }

    #[test]
    fn zero_k_is_invalid() {
        let index = FlatIndex::new(2).unwrap();
        let err = index.search_top_k(&[1.0, 0.0], 0, None);
        assert!(matches!(err, Err(EngineError::InvalidArgument(_))));
    }

    #[test]
    fn k_larger_than_population_returns_all() {
        let mut index = FlatIndex::new(2).unwrap();
        index.insert_one(&unit(&[1.0, 0.0])).unwrap();
        index.insert_one(&unit(&[0.0, 1.0])).unwrap();
        let results = index.search_top_k(&unit(&[1.0, 1.0]), 10, None).unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn expired_deadline_times_out() {
        let mut index = FlatIndex::new(2).unwrap();
        index.insert_one(&unit(&[1.0, 0.0])).unwrap();
        let deadline = Deadline {
            at: Instant::now() - std::time::Duration::from_millis(1),
            budget_ms: 0,
        };
        let err = index.search_top_k(&unit(&[1.0, 0.0]), 1, Some(deadline));
        assert!(matches!(err, Err(EngineError::Timeout { .. })));
    }
}
