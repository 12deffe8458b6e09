//! Face-identity vector index and matching engine.
//!
//! Stores unit-norm facial embeddings per person, serves 1:N identification
//! and 1:1 verification over them, and keeps an approximate index (Flat or
//! IVF-PQ) as a derived, rebuildable cache of the record store.
//!
//! ```
//! use visage::{Engine, EngineConfig, QueryOptions};
//!
//! # fn main() -> visage::Result<()> {
//! let engine = Engine::new(EngineConfig {
//!     dimension: 4,
//!     ..Default::default()
//! })?;
//!
//! let alice = vec![1.0, 0.0, 0.0, 0.0];
//! engine.enroll("alice", alice.clone(), 0.9)?;
//!
//! let matches = engine.identify(&alice, &QueryOptions::default())?;
//! assert_eq!(matches[0].person_id, "alice");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod extract;
pub mod index;
pub mod kmeans;
pub mod persistence;
pub mod policy;
pub mod simd;
pub mod store;
pub mod tombstones;
pub mod vector;

pub use config::{EngineConfig, IndexVariantConfig, IvfPqParams};
pub use coordinator::{CoordinatorStats, IndexCoordinator};
pub use engine::{Engine, EngineStats, EnrollmentItem, QueryOptions};
pub use error::{EngineError, Result};
pub use extract::{EmbeddingExtractor, ExtractedFace, LivenessScorer};
pub use policy::{PersonMatch, VerificationOutcome};
pub use store::{EmbeddingId, EmbeddingRecord, EmbeddingStore};
