//! Pluggable face-embedding extraction.
//!
//! The engine core works on embeddings; turning an image into an embedding
//! is a deployment concern behind these traits. An extractor returns the
//! embedding plus a face-quality score; a liveness scorer is optional and
//! gates spoof attempts before any matching happens.

use crate::error::Result;

/// An extracted face: embedding plus its quality assessment.
#[derive(Debug, Clone)]
pub struct ExtractedFace {
    /// Unit-norm embedding at the engine's configured dimension.
    pub embedding: Vec<f32>,
    /// Face quality in [0, 1]; gates enrollment and optionally probes.
    pub quality: f32,
}

/// Produces embeddings from raw image bytes.
///
/// Implementations wrap whatever model runtime a deployment uses. Failures
/// (no face found, decode error, model failure) surface as
/// `EngineError::Extraction`.
pub trait EmbeddingExtractor: Send + Sync {
    fn extract(&self, image: &[u8]) -> Result<ExtractedFace>;
}

/// Scores how likely an image shows a live subject rather than a
/// presentation attack. Confidence in [0, 1].
pub trait LivenessScorer: Send + Sync {
    fn score(&self, image: &[u8]) -> Result<f32>;
}
