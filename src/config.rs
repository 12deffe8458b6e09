//! Engine configuration.
//!
//! All tunables live here so deployments can load them from a single config
//! document. Thresholds that callers may override per query (similarity
//! threshold, top-k, probe quality gate) are defaults only; the engine
//! accepts per-call overrides.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Which ANN index variant backs the gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndexVariantConfig {
    /// Brute-force inner-product scan. Exact, no training.
    Flat,
    /// Inverted file with product quantization. Approximate, trained.
    IvfPq(IvfPqParams),
}

impl IndexVariantConfig {
    /// Short name for stats and logging.
    pub fn name(&self) -> &'static str {
        match self {
            IndexVariantConfig::Flat => "flat",
            IndexVariantConfig::IvfPq(_) => "ivf_pq",
        }
    }
}

/// IVF-PQ tuning parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IvfPqParams {
    /// Number of inverted lists (coarse clusters).
    pub nlist: usize,
    /// Number of inverted lists probed per query. Recall/latency trade-off,
    /// not a correctness knob.
    pub n_probe: usize,
    /// Number of PQ codebooks (subvectors per embedding).
    pub num_codebooks: usize,
    /// Codewords per codebook.
    pub codebook_size: usize,
    /// Retrain once inserts since last training exceed this fraction of the
    /// trained set.
    pub drift_threshold: f32,
    /// Retrain once total vectors exceed `capacity_per_list * nlist`.
    pub capacity_per_list: usize,
    /// Seed for k-means++ so training (and snapshot import) is reproducible.
    pub train_seed: u64,
}

impl Default for IvfPqParams {
    fn default() -> Self {
        Self {
            nlist: 100,
            n_probe: 16,
            num_codebooks: 8,
            codebook_size: 256,
            drift_threshold: 0.2,
            capacity_per_list: 512,
            train_seed: 0x5eed,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Embedding dimension, fixed per deployment.
    pub dimension: usize,
    /// Allowed deviation of stored vector norms from 1.0.
    pub norm_epsilon: f32,
    /// Default similarity threshold for identification/verification.
    pub similarity_threshold: f32,
    /// Default number of candidates returned by identification.
    pub top_k: usize,
    /// Index variant and its tuning.
    pub index: IndexVariantConfig,
    /// Schedule a rebuild once tombstones exceed this fraction of the live
    /// index.
    pub tombstone_rebuild_ratio: f32,
    /// Minimum face quality accepted at enrollment.
    pub enroll_quality_threshold: f32,
    /// Minimum probe quality accepted at query time, when the caller
    /// supplies a probe quality score. `None` disables the gate.
    pub probe_quality_threshold: Option<f32>,
    /// Minimum liveness confidence, when a liveness scorer is configured.
    pub liveness_threshold: Option<f32>,
    /// Latency budget for a single search. `None` disables the deadline.
    pub search_budget_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dimension: 512,
            norm_epsilon: 1e-3,
            similarity_threshold: 0.65,
            top_k: 5,
            index: IndexVariantConfig::Flat,
            tombstone_rebuild_ratio: 0.1,
            enroll_quality_threshold: 0.5,
            probe_quality_threshold: None,
            liveness_threshold: None,
            search_budget_ms: None,
        }
    }
}

impl EngineConfig {
    /// Validate internal consistency. Called by the engine at construction.
    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(EngineError::InvalidArgument(
                "dimension must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(EngineError::InvalidArgument(format!(
                "similarity_threshold {} must be in [0, 1]",
                self.similarity_threshold
            )));
        }
        if self.top_k == 0 {
            return Err(EngineError::InvalidArgument(
                "top_k must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.tombstone_rebuild_ratio) {
            return Err(EngineError::InvalidArgument(format!(
                "tombstone_rebuild_ratio {} must be in [0, 1]",
                self.tombstone_rebuild_ratio
            )));
        }
        if let IndexVariantConfig::IvfPq(params) = &self.index {
            if params.nlist == 0 || params.n_probe == 0 {
                return Err(EngineError::InvalidArgument(
                    "nlist and n_probe must be greater than 0".to_string(),
                ));
            }
            if params.num_codebooks == 0 || params.codebook_size == 0 {
                return Err(EngineError::InvalidArgument(
                    "num_codebooks and codebook_size must be greater than 0".to_string(),
                ));
            }
            if params.codebook_size > 256 {
                return Err(EngineError::InvalidArgument(
                    "codebook_size must fit in a u8 code (max 256)".to_string(),
                ));
            }
            if self.dimension % params.num_codebooks != 0 {
                return Err(EngineError::InvalidArgument(format!(
                    "dimension {} must be divisible by num_codebooks {}",
                    self.dimension, params.num_codebooks
                )));
            }
            if !(0.0..=1.0).contains(&params.drift_threshold) {
                return Err(EngineError::InvalidArgument(format!(
                    "drift_threshold {} must be in [0, 1]",
                    params.drift_threshold
                )));
            }
        }
        Ok(())
    }
}
