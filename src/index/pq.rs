//! Product quantization.
//!
//! Splits each embedding into `num_codebooks` subvectors and quantizes each
//! against a small trained codebook, storing one `u8` code per subvector.
//! Queries precompute an asymmetric similarity table (dot product of each
//! query subvector against every codeword), so scoring a compressed vector
//! is `num_codebooks` table lookups and additions. Summed subvector dot
//! products approximate the full inner product, keeping PQ scores directly
//! comparable to exact Flat similarities.

use smallvec::SmallVec;

use crate::error::{EngineError, Result};
use crate::kmeans::KMeans;
use crate::simd;

/// Trained product quantizer.
#[derive(Debug, Clone)]
pub struct ProductQuantizer {
    dimension: usize,
    num_codebooks: usize,
    codebook_size: usize,
    subvector_dim: usize,
    /// `[codebook][codeword][dimension]`
    codebooks: Vec<Vec<Vec<f32>>>,
}

impl ProductQuantizer {
    /// Train a quantizer on `num_vectors` vectors in SoA layout.
    ///
    /// `codebook_size` is clamped to the training population so tiny
    /// galleries still train; the codes just become lossless in that case.
    pub fn fit(
        vectors: &[f32],
        num_vectors: usize,
        dimension: usize,
        num_codebooks: usize,
        codebook_size: usize,
        seed: u64,
    ) -> Result<Self> {
        if dimension == 0 || num_codebooks == 0 || codebook_size == 0 {
            return Err(EngineError::InvalidArgument(
                "PQ parameters must be greater than 0".to_string(),
            ));
        }
        if dimension % num_codebooks != 0 {
            return Err(EngineError::InvalidArgument(format!(
                "dimension {dimension} must be divisible by num_codebooks {num_codebooks}"
            )));
        }
        if num_vectors == 0 {
            return Err(EngineError::InvalidArgument(
                "cannot train PQ on zero vectors".to_string(),
            ));
        }
        let subvector_dim = dimension / num_codebooks;
        let effective_size = codebook_size.min(num_vectors).min(256);

        let mut codebooks = Vec::with_capacity(num_codebooks);
        for codebook_idx in 0..num_codebooks {
            let start_dim = codebook_idx * subvector_dim;

            // Gather this codebook's subvectors into SoA form for k-means.
            let mut flat = Vec::with_capacity(num_vectors * subvector_dim);
            for i in 0..num_vectors {
                let start = i * dimension + start_dim;
                flat.extend_from_slice(&vectors[start..start + subvector_dim]);
            }

            let mut km = KMeans::new(subvector_dim, effective_size)?
                .with_seed(seed.wrapping_add(codebook_idx as u64));
            km.fit(&flat, num_vectors)?;
            codebooks.push(km.into_centroids());
        }

        Ok(Self {
            dimension,
            num_codebooks,
            codebook_size: effective_size,
            subvector_dim,
            codebooks,
        })
    }

    /// Quantize a vector into one code per codebook. Inlined storage for
    /// the common 8-16 codebook configurations.
    pub fn quantize(&self, vector: &[f32]) -> SmallVec<[u8; 16]> {
        let mut codes = SmallVec::new();
        for codebook_idx in 0..self.num_codebooks {
            let start = codebook_idx * self.subvector_dim;
            let subvector = &vector[start..start + self.subvector_dim];

            let mut best_code = 0u8;
            let mut best_sim = f32::NEG_INFINITY;
            for (code, codeword) in self.codebooks[codebook_idx].iter().enumerate() {
                let sim = simd::dot(subvector, codeword);
                if sim > best_sim {
                    best_sim = sim;
                    best_code = code as u8;
                }
            }
            codes.push(best_code);
        }
        codes
    }

    /// Precompute the asymmetric similarity table for a query.
    ///
    /// Layout: `[codebook_0_codeword_0, codebook_0_codeword_1, ...,
    /// codebook_1_codeword_0, ...]`.
    pub fn similarity_table(&self, query: &[f32]) -> Result<Vec<f32>> {
        if query.len() != self.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        let mut table = Vec::with_capacity(self.num_codebooks * self.codebook_size);
        for codebook_idx in 0..self.num_codebooks {
            let start = codebook_idx * self.subvector_dim;
            let query_subvector = &query[start..start + self.subvector_dim];
            for codeword in &self.codebooks[codebook_idx] {
                table.push(simd::dot(query_subvector, codeword));
            }
        }
        Ok(table)
    }

    /// Approximate inner product from codes: table lookups and additions.
    #[inline]
    pub fn similarity_with_table(&self, table: &[f32], codes: &[u8]) -> f32 {
        let mut total = 0.0;
        for (codebook_idx, &code) in codes.iter().enumerate() {
            total += table[codebook_idx * self.codebook_size + code as usize];
        }
        total
    }

    pub fn num_codebooks(&self) -> usize {
        self.num_codebooks
    }
}
