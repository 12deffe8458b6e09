//! Error types for the matching engine.

use thiserror::Error;

use crate::store::EmbeddingId;

/// Errors that can occur during enrollment, search, and maintenance.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Vector failed validation (zero/NaN norm, deviation from unit length).
    #[error("invalid vector: {0}")]
    InvalidVector(String),

    /// Dimension mismatch between a vector and the configured dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Unknown embedding id (never issued by the store).
    #[error("embedding {0} not found")]
    NotFound(EmbeddingId),

    /// Verification target has no active embeddings.
    #[error("person '{0}' has no active embeddings")]
    PersonNotFound(String),

    /// Bad caller-supplied parameter (k, threshold, config value).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Embedding extraction failed; a query-level failure, not an engine fault.
    #[error("embedding extraction failed: {0}")]
    Extraction(String),

    /// Face quality below the configured gate.
    #[error("face quality {score:.2} below threshold {threshold:.2}")]
    QualityTooLow { score: f32, threshold: f32 },

    /// Liveness confidence below the configured gate.
    #[error("liveness confidence {confidence:.2} below threshold {threshold:.2}")]
    LivenessRejected { confidence: f32, threshold: f32 },

    /// IVF-PQ used before first training completes. Queries fail closed
    /// rather than silently degrading to an exact scan, keeping latency
    /// predictable; rejected inserts are deferred by the coordinator until
    /// the next rebuild trains the generation.
    #[error("index not trained yet")]
    IndexUnready,

    /// Search exceeded its latency budget.
    #[error("search exceeded latency budget of {budget_ms} ms")]
    Timeout { budget_ms: u64 },

    /// Rebuild failed; the previous generation keeps serving.
    #[error("rebuild failed: {0}")]
    RebuildFailed(String),

    /// I/O error from snapshot export/import.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot format error (bad magic, version, truncation, decode failure).
    #[error("snapshot error: {0}")]
    Snapshot(String),

    /// Snapshot checksum mismatch (corruption detected).
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
