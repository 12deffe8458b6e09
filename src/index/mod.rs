//! ANN index variants behind a single capability surface.
//!
//! The index owns only vector ids and raw or quantized embeddings; identity
//! metadata lives in the record store. Two variants:
//!
//! - [`flat::FlatIndex`]: brute-force inner-product scan. Exact.
//! - [`ivf_pq::IvfPqIndex`]: inverted file with product quantization.
//!   Approximate; requires training before any insert is accepted.
//!
//! The variants share no mutable base state; [`AnyIndex`] is a tagged enum
//! dispatching the four operations.

pub mod flat;
pub mod ivf_pq;
pub mod pq;

use std::time::Instant;

use crate::error::{EngineError, Result};

pub use flat::FlatIndex;
pub use ivf_pq::IvfPqIndex;

/// Dense per-generation vector id. Position in insertion order; the
/// coordinator maps it back to an embedding id.
pub type VectorId = u32;

/// Latency budget for one search, checked inside scan/probe loops.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    pub at: Instant,
    pub budget_ms: u64,
}

impl Deadline {
    pub fn from_budget_ms(budget_ms: u64) -> Self {
        Self {
            at: Instant::now() + std::time::Duration::from_millis(budget_ms),
            budget_ms,
        }
    }

    #[inline]
    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }
}

/// Capability set shared by all index variants.
pub trait VectorIndex {
    /// Append one vector, returning its id in this generation.
    fn insert_one(&mut self, vector: &[f32]) -> Result<VectorId>;

    /// Append a batch of vectors, returning their ids in order.
    fn insert_batch(&mut self, vectors: &[Vec<f32>]) -> Result<Vec<VectorId>> {
        let mut ids = Vec::with_capacity(vectors.len());
        for vector in vectors {
            ids.push(self.insert_one(vector)?);
        }
        Ok(ids)
    }

    /// Top-k by descending similarity. `k == 0` fails with
    /// `InvalidArgument`; an empty trained index returns an empty vec,
    /// while an untrained IVF-PQ index fails with `IndexUnready`.
    /// Searches past `deadline` fail with `Timeout`.
    fn search_top_k(
        &self,
        query: &[f32],
        k: usize,
        deadline: Option<Deadline>,
    ) -> Result<Vec<(VectorId, f32)>>;

    /// Whether accumulated drift warrants retraining (always false for Flat).
    fn needs_retrain(&self) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn dimension(&self) -> usize;
}

/// Tagged variant erasing the concrete index type.
#[derive(Debug)]
pub enum AnyIndex {
    Flat(FlatIndex),
    IvfPq(IvfPqIndex),
}

impl AnyIndex {
    pub fn variant_name(&self) -> &'static str {
        match self {
            AnyIndex::Flat(_) => "flat",
            AnyIndex::IvfPq(_) => "ivf_pq",
        }
    }

    /// Whether the variant is ready to accept inserts and serve searches.
    /// Flat always is; IVF-PQ only after training.
    pub fn is_trained(&self) -> bool {
        match self {
            AnyIndex::Flat(_) => true,
            AnyIndex::IvfPq(index) => index.is_trained(),
        }
    }
}

impl VectorIndex for AnyIndex {
    fn insert_one(&mut self, vector: &[f32]) -> Result<VectorId> {
        match self {
            AnyIndex::Flat(index) => index.insert_one(vector),
            AnyIndex::IvfPq(index) => index.insert_one(vector),
        }
    }

    fn insert_batch(&mut self, vectors: &[Vec<f32>]) -> Result<Vec<VectorId>> {
        match self {
            AnyIndex::Flat(index) => index.insert_batch(vectors),
            AnyIndex::IvfPq(index) => index.insert_batch(vectors),
        }
    }

    fn search_top_k(
        &self,
        query: &[f32],
        k: usize,
        deadline: Option<Deadline>,
    ) -> Result<Vec<(VectorId, f32)>> {
        match self {
            AnyIndex::Flat(index) => index.search_top_k(query, k, deadline),
            AnyIndex::IvfPq(index) => index.search_top_k(query, k, deadline),
        }
    }

    fn needs_retrain(&self) -> bool {
        match self {
            AnyIndex::Flat(index) => index.needs_retrain(),
            AnyIndex::IvfPq(index) => index.needs_retrain(),
        }
    }

    fn len(&self) -> usize {
        match self {
            AnyIndex::Flat(index) => index.len(),
            AnyIndex::IvfPq(index) => index.len(),
        }
    }

    fn dimension(&self) -> usize {
        match self {
            AnyIndex::Flat(index) => index.dimension(),
            AnyIndex::IvfPq(index) => index.dimension(),
        }
    }
}

pub(crate) fn validate_k(k: usize) -> Result<()> {
    if k == 0 {
        return Err(EngineError::InvalidArgument(
            "k must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn check_deadline(deadline: Option<Deadline>) -> Result<()> {
    if let Some(deadline) = deadline {
        if deadline.expired() {
            return Err(EngineError::Timeout {
                budget_ms: deadline.budget_ms,
            });
        }
    }
    Ok(())
}
