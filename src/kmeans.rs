//! Seeded k-means clustering.
//!
//! Used for IVF coarse-quantizer centroids and PQ codebook training. Inputs
//! are expected to be L2-normalized; distance is dot-product cosine.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{EngineError, Result};
use crate::simd;

const MAX_ITERATIONS: usize = 100;
const CONVERGENCE_EPSILON: f32 = 1e-6;

/// k-means with k-means++ initialization over SoA vector storage.
pub struct KMeans {
    centroids: Vec<Vec<f32>>,
    dimension: usize,
    k: usize,
    seed: Option<u64>,
}

impl KMeans {
    pub fn new(dimension: usize, k: usize) -> Result<Self> {
        if dimension == 0 || k == 0 {
            return Err(EngineError::InvalidArgument(
                "k-means dimension and k must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            centroids: Vec::new(),
            dimension,
            k,
            seed: None,
        })
    }

    /// Configure a deterministic seed for k-means++ initialization.
    ///
    /// When set, repeated `fit(...)` calls on the same inputs produce
    /// identical results; snapshot import relies on this.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Train on `num_vectors` vectors stored contiguously in `vectors`.
    pub fn fit(&mut self, vectors: &[f32], num_vectors: usize) -> Result<()> {
        if vectors.len() < num_vectors * self.dimension {
            return Err(EngineError::InvalidArgument(
                "insufficient vectors for k-means training".to_string(),
            ));
        }
        if num_vectors < self.k {
            return Err(EngineError::InvalidArgument(format!(
                "cannot fit {} clusters on {} vectors",
                self.k, num_vectors
            )));
        }

        self.centroids = self.kmeans_plus_plus(vectors, num_vectors);

        for _iteration in 0..MAX_ITERATIONS {
            let assignments = self.assign_clusters(vectors, num_vectors);
            let new_centroids = self.update_centroids(vectors, num_vectors, &assignments);

            let converged = self
                .centroids
                .iter()
                .zip(new_centroids.iter())
                .all(|(old, new)| self.distance(old, new) <= CONVERGENCE_EPSILON);

            self.centroids = new_centroids;
            if converged {
                break;
            }
        }

        Ok(())
    }

    fn kmeans_plus_plus(&self, vectors: &[f32], num_vectors: usize) -> Vec<Vec<f32>> {
        let seed = self.seed.unwrap_or_else(|| rand::rng().random());
        let mut rng = StdRng::seed_from_u64(seed);

        let mut centroids = Vec::with_capacity(self.k);
        let first_idx = rng.random_range(0..num_vectors);
        centroids.push(self.get_vector(vectors, first_idx).to_vec());

        // Subsequent centroids weighted by distance to the nearest chosen one.
        while centroids.len() < self.k {
            let mut distances = Vec::with_capacity(num_vectors);
            let mut total_distance = 0.0f64;

            for i in 0..num_vectors {
                let vec = self.get_vector(vectors, i);
                let min_dist = centroids
                    .iter()
                    .map(|c| self.distance(vec, c))
                    .fold(f32::INFINITY, f32::min);
                distances.push(min_dist);
                total_distance += min_dist as f64;
            }

            if total_distance <= 0.0 {
                // All remaining points coincide with chosen centroids.
                let idx = rng.random_range(0..num_vectors);
                centroids.push(self.get_vector(vectors, idx).to_vec());
                continue;
            }

            let threshold = rng.random::<f64>() * total_distance;
            let mut cumulative = 0.0f64;
            let mut chosen = num_vectors - 1;
            for (i, &dist) in distances.iter().enumerate() {
                cumulative += dist as f64;
                if cumulative >= threshold {
                    chosen = i;
                    break;
                }
            }
            centroids.push(self.get_vector(vectors, chosen).to_vec());
        }

        centroids
    }

    /// Assign each vector to its nearest centroid.
    pub fn assign_clusters(&self, vectors: &[f32], num_vectors: usize) -> Vec<usize> {
        let mut assignments = Vec::with_capacity(num_vectors);
        for i in 0..num_vectors {
            let vec = self.get_vector(vectors, i);
            assignments.push(self.nearest_centroid(vec));
        }
        assignments
    }

    /// Index of the centroid nearest to `vec`.
    pub fn nearest_centroid(&self, vec: &[f32]) -> usize {
        let mut best_cluster = 0;
        let mut best_dist = f32::INFINITY;
        for (cluster_idx, centroid) in self.centroids.iter().enumerate() {
            let dist = self.distance(vec, centroid);
            if dist < best_dist {
                best_dist = dist;
                best_cluster = cluster_idx;
            }
        }
        best_cluster
    }

    fn update_centroids(
        &self,
        vectors: &[f32],
        num_vectors: usize,
        assignments: &[usize],
    ) -> Vec<Vec<f32>> {
        let mut cluster_sums = vec![vec![0.0f32; self.dimension]; self.k];
        let mut cluster_counts = vec![0usize; self.k];

        for (i, &cluster) in assignments.iter().enumerate().take(num_vectors) {
            cluster_counts[cluster] += 1;
            let vec = self.get_vector(vectors, i);
            for (j, &val) in vec.iter().enumerate() {
                cluster_sums[cluster][j] += val;
            }
        }

        cluster_sums
            .iter()
            .zip(cluster_counts.iter())
            .enumerate()
            .map(|(idx, (sums, &count))| {
                if count > 0 {
                    sums.iter().map(|&s| s / count as f32).collect()
                } else {
                    // Empty cluster: keep the old centroid.
                    self.centroids[idx].clone()
                }
            })
            .collect()
    }

    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        1.0 - simd::dot(a, b)
    }

    fn get_vector<'a>(&self, vectors: &'a [f32], idx: usize) -> &'a [f32] {
        let start = idx * self.dimension;
        &vectors[start..start + self.dimension]
    }

    pub fn centroids(&self) -> &[Vec<f32>] {
        &self.centroids
    }

    /// Consume the trained model, returning its centroids.
    pub fn into_centroids(self) -> Vec<Vec<f32>> {
        self.centroids
    }
}
