//! Inverted-file index with product quantization.
//!
//! Training partitions the gallery into `nlist` clusters with seeded
//! k-means, then trains a [`ProductQuantizer`] over the same vectors.
//! Each vector lives in exactly one inverted list, stored as PQ codes.
//! A search scores the query against all coarse centroids, visits the
//! `n_probe` closest lists, and ranks their members with an asymmetric
//! distance table. Untrained indexes reject both inserts and searches
//! with `IndexUnready`; the coordinator defers rejected inserts until the
//! next rebuild trains the generation.

use tracing::debug;

use crate::config::IvfPqParams;
use crate::error::{EngineError, Result};
use crate::index::pq::ProductQuantizer;
use crate::index::{check_deadline, validate_k, Deadline, VectorId, VectorIndex};
use crate::kmeans::KMeans;
use crate::simd;

/// Deadline poll cadence while scanning probed lists.
const DEADLINE_STRIDE: usize = 1024;

#[derive(Debug)]
struct TrainedState {
    /// Coarse cluster centroids, one per inverted list.
    centroids: Vec<Vec<f32>>,
    pq: ProductQuantizer,
    /// Member vector ids per inverted list.
    lists: Vec<Vec<VectorId>>,
    /// PQ codes indexed by vector id, `num_codebooks` bytes each.
    codes: Vec<u8>,
    /// Population size at training time, for drift accounting.
    trained_on: usize,
    inserted_since_train: usize,
}

/// Approximate index; see module docs.
#[derive(Debug)]
pub struct IvfPqIndex {
    dimension: usize,
    params: IvfPqParams,
    num_vectors: usize,
    trained: Option<TrainedState>,
}

impl IvfPqIndex {
    pub fn new(dimension: usize, params: IvfPqParams) -> Result<Self> {
        if dimension == 0 {
            return Err(EngineError::InvalidArgument(
                "dimension must be greater than 0".to_string(),
            ));
        }
        if dimension % params.num_codebooks != 0 {
            return Err(EngineError::InvalidArgument(format!(
                "dimension {dimension} must be divisible by num_codebooks {}",
                params.num_codebooks
            )));
        }
        Ok(Self {
            dimension,
            params,
            num_vectors: 0,
            trained: None,
        })
    }

    pub fn is_trained(&self) -> bool {
        self.trained.is_some()
    }

    pub fn params(&self) -> &IvfPqParams {
        &self.params
    }

    /// Seed used for coarse k-means and PQ training. Recorded in snapshots
    /// so an import retrains to identical structure.
    pub fn train_seed(&self) -> u64 {
        self.params.train_seed
    }

    /// Train coarse centroids and the quantizer, then assign every vector.
    ///
    /// `vectors` is the full population in SoA layout. `nlist` is clamped
    /// to the population so small galleries still train. Replaces any
    /// previous trained state.
    pub fn train(&mut self, vectors: &[f32], num_vectors: usize) -> Result<()> {
        if num_vectors == 0 {
            return Err(EngineError::InvalidArgument(
                "cannot train on zero vectors".to_string(),
            ));
        }
        if vectors.len() != num_vectors * self.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: num_vectors * self.dimension,
                actual: vectors.len(),
            });
        }

        let nlist = self.params.nlist.min(num_vectors);
        let mut coarse =
            KMeans::new(self.dimension, nlist)?.with_seed(self.params.train_seed);
        coarse.fit(vectors, num_vectors)?;

        let pq = ProductQuantizer::fit(
            vectors,
            num_vectors,
            self.dimension,
            self.params.num_codebooks,
            self.params.codebook_size,
            self.params.train_seed,
        )?;

        let assignments = coarse.assign_clusters(vectors, num_vectors);
        let mut lists: Vec<Vec<VectorId>> = vec![Vec::new(); nlist];
        let mut codes = Vec::with_capacity(num_vectors * self.params.num_codebooks);
        for (i, &list_idx) in assignments.iter().enumerate() {
            lists[list_idx].push(i as VectorId);
            let start = i * self.dimension;
            codes.extend(pq.quantize(&vectors[start..start + self.dimension]));
        }

        debug!(
            nlist,
            num_vectors,
            num_codebooks = self.params.num_codebooks,
            "trained ivf_pq index"
        );

        self.trained = Some(TrainedState {
            centroids: coarse.into_centroids(),
            pq,
            lists,
            codes,
            trained_on: num_vectors,
            inserted_since_train: 0,
        });
        self.num_vectors = num_vectors;
        Ok(())
    }

    fn nearest_centroid(centroids: &[Vec<f32>], vector: &[f32]) -> usize {
        let mut best = 0;
        let mut best_sim = f32::NEG_INFINITY;
        for (i, centroid) in centroids.iter().enumerate() {
            let sim = simd::dot(vector, centroid);
            if sim > best_sim {
                best_sim = sim;
                best = i;
            }
        }
        best
    }
}

impl VectorIndex for IvfPqIndex {
    fn insert_one(&mut self, vector: &[f32]) -> Result<VectorId> {
        if vector.len() != self.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        let state = self.trained.as_mut().ok_or(EngineError::IndexUnready)?;

        let id = self.num_vectors as VectorId;
        let list_idx = Self::nearest_centroid(&state.centroids, vector);
        state.lists[list_idx].push(id);
        state.codes.extend(state.pq.quantize(vector));
        state.inserted_since_train += 1;
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
        // Fails closed before training so query latency stays predictable;
        // no silent exact-scan fallback.
        let state = self.trained.as_ref().ok_or(EngineError::IndexUnready)?;
        check_deadline(deadline)?;

        // Rank coarse centroids by similarity to the query.
        let mut centroid_order: Vec<(usize, f32)> = state
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, simd::dot(query, c)))
            .collect();
        centroid_order.sort_by(|a, b| b.1.total_cmp(&a.1));

        let table = state.pq.similarity_table(query)?;
        let n_probe = self.params.n_probe.max(1).min(centroid_order.len());
        let num_codebooks = state.pq.num_codebooks();

        let mut results: Vec<(VectorId, f32)> = Vec::new();
        let mut scanned = 0usize;
        for &(list_idx, _) in centroid_order.iter().take(n_probe) {
            for &id in &state.lists[list_idx] {
                if scanned % DEADLINE_STRIDE == 0 {
                    check_deadline(deadline)?;
                }
                scanned += 1;
                let start = id as usize * num_codebooks;
                let codes = &state.codes[start..start + num_codebooks];
                results.push((id, state.pq.similarity_with_table(&table, codes)));
            }
        }

        results.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        results.truncate(k);
        Ok(results)
    }

    fn needs_retrain(&self) -> bool {
        match &self.trained {
            Some(state) => {
                let drifted = state.trained_on > 0
                    && state.inserted_since_train as f32 / state.trained_on as f32
                        > self.params.drift_threshold;
                let over_capacity = self.num_vectors
                    > self.params.capacity_per_list * self.params.nlist;
                drifted || over_capacity
            }
            None => self.num_vectors > 0,
        }
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

    fn small_params() -> IvfPqParams {
        IvfPqParams {
            nlist: 4,
            n_probe: 4,
            num_codebooks: 2,
            codebook_size: 16,
            drift_threshold: 0.2,
            capacity_per_list: 512,
            train_seed: 42,
        }
    }

    fn gallery() -> Vec<Vec<f32>> {
        let mut vectors = Vec::new();
        for i in 0..16 {
            let t = i as f32 * 0.02;
            vectors.push(normalize(&[1.0, t, 0.0, 0.0]).unwrap());
            vectors.push(normalize(&[0.0, 0.0, 1.0, t]).unwrap());
            vectors.push(normalize(&[0.0, 1.0, 0.0, t]).unwrap());
        }
        vectors
    }

    fn soa(vectors: &[Vec<f32>]) -> Vec<f32> {
        vectors.iter().flatten().copied().collect()
    }

    #[test]
    fn untrained_insert_is_rejected() {
        let mut index = IvfPqIndex::new(4, small_params()).unwrap();
        let v = normalize(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        assert!(matches!(
            index.insert_one(&v),
            Err(EngineError::IndexUnready)
        ));
    }

    #[test]
    fn untrained_search_fails_closed() {
        let index = IvfPqIndex::new(4, small_params()).unwrap();
        let v = normalize(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        assert!(matches!(
            index.search_top_k(&v, 5, None),
            Err(EngineError::IndexUnready)
        ));
    }

    #[test]
    fn trained_search_finds_own_cluster() {
        let vectors = gallery();
        let mut index = IvfPqIndex::new(4, small_params()).unwrap();
        index.train(&soa(&vectors), vectors.len()).unwrap();

        let probe = &vectors[0];
        let results = index.search_top_k(probe, 5, None).unwrap();
        assert_eq!(results.len(), 5);
        // With full probing the best match should come from the probe's
        // own cluster (ids congruent to 0 mod 3).
        assert_eq!(results[0].0 % 3, 0);
        for pair in results.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
    }

    #[test]
    fn insert_after_training_is_searchable() {
        let vectors = gallery();
        let mut index = IvfPqIndex::new(4, small_params()).unwrap();
        index.train(&soa(&vectors), vectors.len()).unwrap();

        let v = normalize(&[1.0, 0.05, 0.0, 0.0]).unwrap();
        let id = index.insert_one(&v).unwrap();
        assert_eq!(id as usize, vectors.len());

        let results = index.search_top_k(&v, vectors.len() + 1, None).unwrap();
        assert!(results.iter().any(|&(rid, _)| rid == id));
    }

    #[test]
    fn drift_triggers_retrain_flag() {
        let vectors = gallery();
        let mut index = IvfPqIndex::new(4, small_params()).unwrap();
        index.train(&soa(&vectors), vectors.len()).unwrap();
        assert!(!index.needs_retrain());

        // drift_threshold 0.2 over 48 trained vectors: 10 inserts crosses it.
        let v = normalize(&[1.0, 0.1, 0.0, 0.0]).unwrap();
        for _ in 0..11 {
            index.insert_one(&v).unwrap();
        }
        assert!(index.needs_retrain());
    }

    #[test]
    fn nlist_clamped_to_tiny_population() {
        let vectors: Vec<Vec<f32>> = vec![
            normalize(&[1.0, 0.0, 0.0, 0.0]).unwrap(),
            normalize(&[0.0, 1.0, 0.0, 0.0]).unwrap(),
        ];
        let mut index = IvfPqIndex::new(4, small_params()).unwrap();
        index.train(&soa(&vectors), vectors.len()).unwrap();
        let results = index.search_top_k(&vectors[0], 2, None).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, 0);
    }

    #[test]
    fn retrain_seed_is_deterministic() {
        let vectors = gallery();
        let flat = soa(&vectors);
        let mut a = IvfPqIndex::new(4, small_params()).unwrap();
        let mut b = IvfPqIndex::new(4, small_params()).unwrap();
        a.train(&flat, vectors.len()).unwrap();
        b.train(&flat, vectors.len()).unwrap();

        let probe = &vectors[5];
        let ra = a.search_top_k(probe, 8, None).unwrap();
        let rb = b.search_top_k(probe, 8, None).unwrap();
        assert_eq!(ra, rb);
    }
}
