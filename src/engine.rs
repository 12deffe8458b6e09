//! Identification engine: the public surface tying store, coordinator and
//! policy together.
//!
//! Every operation that changes what is searchable writes the store first,
//! then the index; a failed index attach rolls the store record back so the
//! two never drift apart.

use std::path::Path;
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::coordinator::{CoordinatorStats, IndexCoordinator};
use crate::error::{EngineError, Result};
use crate::extract::{EmbeddingExtractor, LivenessScorer};
use crate::index::Deadline;
use crate::persistence::{self, Snapshot, FORMAT_VERSION};
use crate::policy::{self, PersonMatch, RawHit, VerificationOutcome};
use crate::store::{EmbeddingId, EmbeddingStore};
use crate::vector;

/// Per-query overrides. `None` falls back to the engine configuration.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub threshold: Option<f32>,
    pub top_k: Option<usize>,
    /// Probe quality gate for image queries; ignored for raw embeddings.
    pub min_quality: Option<f32>,
}

/// Point-in-time counters for operators.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub persons: usize,
    pub active_embeddings: usize,
    pub index: CoordinatorStats,
}

/// One item of a batch enrollment.
#[derive(Debug, Clone)]
pub struct EnrollmentItem {
    pub vector: Vec<f32>,
    pub quality: f32,
}

pub struct Engine {
    config: EngineConfig,
    store: Arc<EmbeddingStore>,
    coordinator: Arc<IndexCoordinator>,
    extractor: Option<Arc<dyn EmbeddingExtractor>>,
    liveness: Option<Arc<dyn LivenessScorer>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(EmbeddingStore::new(config.dimension, config.norm_epsilon));
        let coordinator = Arc::new(IndexCoordinator::new(config.clone(), Arc::clone(&store))?);
        info!(
            dimension = config.dimension,
            index = config.index.name(),
            "engine initialized"
        );
        Ok(Self {
            config,
            store,
            coordinator,
            extractor: None,
            liveness: None,
        })
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn EmbeddingExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_liveness(mut self, liveness: Arc<dyn LivenessScorer>) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Enroll one embedding for a person.
    ///
    /// The store record is created first; if the index attach fails, the
    /// record is deactivated again so search and truth stay consistent.
    pub fn enroll(
        &self,
        person_id: impl Into<String>,
        vector: Vec<f32>,
        quality: f32,
    ) -> Result<EmbeddingId> {
        let person_id = person_id.into();
        if person_id.is_empty() {
            return Err(EngineError::InvalidArgument(
                "person_id must not be empty".to_string(),
            ));
        }
        if quality < self.config.enroll_quality_threshold {
            return Err(EngineError::QualityTooLow {
                score: quality,
                threshold: self.config.enroll_quality_threshold,
            });
        }

        let id = self.store.insert(&person_id, vector.clone(), quality)?;
        if let Err(e) = self.coordinator.attach(id, &vector) {
            // Roll back so the record never shows as active but unsearchable.
            let _ = self.store.deactivate(id);
            warn!(embedding_id = %id, error = %e, "index attach failed, enrollment rolled back");
            return Err(e);
        }
        debug!(embedding_id = %id, person_id = %person_id, quality, "embedding enrolled");
        Ok(id)
    }

    /// Enroll several embeddings for one person, reporting each outcome.
    /// A failed item does not abort the rest.
    pub fn enroll_batch(
        &self,
        person_id: &str,
        items: Vec<EnrollmentItem>,
    ) -> Vec<Result<EmbeddingId>> {
        items
            .into_iter()
            .map(|item| self.enroll(person_id, item.vector, item.quality))
            .collect()
    }

    /// Extract an embedding from an image and enroll it, applying the
    /// quality gate and, when configured, the liveness gate.
    pub fn enroll_image(&self, person_id: impl Into<String>, image: &[u8]) -> Result<EmbeddingId> {
        let extractor = self.require_extractor()?;
        self.check_liveness(image)?;
        let face = extractor.extract(image)?;
        self.enroll(person_id, face.embedding, face.quality)
    }

    /// Deactivate one embedding and hide it from search. Idempotent.
    pub fn remove(&self, embedding_id: EmbeddingId) -> Result<()> {
        self.store.deactivate(embedding_id)?;
        self.coordinator.detach(embedding_id);
        debug!(embedding_id = %embedding_id, "embedding removed");
        Ok(())
    }

    /// Remove every active embedding of a person, returning how many were
    /// removed. Fails with `PersonNotFound` if none are active.
    pub fn remove_person(&self, person_id: &str) -> Result<usize> {
        let records = self.store.list_active(person_id);
        if records.is_empty() {
            return Err(EngineError::PersonNotFound(person_id.to_string()));
        }
        let count = records.len();
        for record in records {
            self.store.deactivate(record.embedding_id)?;
            self.coordinator.detach(record.embedding_id);
        }
        info!(person_id = %person_id, removed = count, "person removed");
        Ok(count)
    }

    /// 1:N identification: ranked person candidates at or above threshold.
    ///
    /// An empty gallery returns an empty list rather than an error.
    pub fn identify(&self, probe: &[f32], options: &QueryOptions) -> Result<Vec<PersonMatch>> {
        vector::validate_unit(probe, self.config.dimension, self.config.norm_epsilon)?;
        let threshold = options.threshold.unwrap_or(self.config.similarity_threshold);
        let top_k = options.top_k.unwrap_or(self.config.top_k);
        if top_k == 0 {
            return Err(EngineError::InvalidArgument(
                "top_k must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&threshold) {
            return Err(EngineError::InvalidArgument(format!(
                "threshold {threshold} must be in [0, 1]"
            )));
        }
        if self.store.active_count() == 0 {
            return Ok(Vec::new());
        }

        // Overfetch for per-person dedup, doubling until top_k distinct
        // persons are found or the whole gallery has been fetched, so one
        // person with many strong embeddings cannot crowd others out.
        let deadline = self.config.search_budget_ms.map(Deadline::from_budget_ms);
        let active = self.store.active_count();
        let mut fetch = top_k.saturating_mul(4).min(active);
        let matches = loop {
            let raw = self.coordinator.search(probe, fetch, deadline)?;
            let mut hits = Vec::with_capacity(raw.len());
            for (embedding_id, similarity) in raw {
                // Records can go inactive between index search and join.
                if let Some(record) = self.store.get(embedding_id) {
                    if record.active {
                        hits.push(RawHit {
                            embedding_id,
                            person_id: record.person_id,
                            similarity,
                            created_at_us: record.created_at_us,
                        });
                    }
                }
            }
            let matches = policy::rank_candidates(hits, threshold, top_k);
            if matches.len() >= top_k || fetch >= active {
                break matches;
            }
            fetch = fetch.saturating_mul(2).min(active);
        };
        debug!(
            candidates = matches.len(),
            threshold, top_k, "identification served"
        );
        Ok(matches)
    }

    /// Identify from an image, applying probe quality and liveness gates.
    pub fn identify_image(&self, image: &[u8], options: &QueryOptions) -> Result<Vec<PersonMatch>> {
        let extractor = self.require_extractor()?;
        self.check_liveness(image)?;
        let face = extractor.extract(image)?;
        let min_quality = options
            .min_quality
            .or(self.config.probe_quality_threshold);
        if let Some(min_quality) = min_quality {
            if face.quality < min_quality {
                return Err(EngineError::QualityTooLow {
                    score: face.quality,
                    threshold: min_quality,
                });
            }
        }
        self.identify(&face.embedding, options)
    }

    /// 1:1 verification against a claimed identity.
    ///
    /// Compares exactly against the person's active embeddings; the ANN
    /// index is never involved, so the decision is independent of index
    /// recall.
    pub fn verify(
        &self,
        person_id: &str,
        probe: &[f32],
        threshold: Option<f32>,
    ) -> Result<VerificationOutcome> {
        vector::validate_unit(probe, self.config.dimension, self.config.norm_epsilon)?;
        let threshold = threshold.unwrap_or(self.config.similarity_threshold);
        let records = self.store.list_active(person_id);
        if records.is_empty() {
            return Err(EngineError::PersonNotFound(person_id.to_string()));
        }
        let similarities: Vec<f32> = records
            .iter()
            .map(|record| vector::similarity(probe, &record.vector))
            .collect();
        Ok(policy::verify_outcome(
            person_id.to_string(),
            &similarities,
            threshold,
        ))
    }

    /// Whether tombstone ratio or index drift calls for a rebuild.
    pub fn needs_rebuild(&self) -> bool {
        self.coordinator.needs_rebuild()
    }

    /// Rebuild synchronously. Returns false if one was already in flight.
    pub fn rebuild_now(&self) -> Result<bool> {
        self.coordinator.rebuild()
    }

    /// Rebuild on a background thread. Searches keep serving the previous
    /// generation until the swap.
    pub fn spawn_rebuild(&self) -> thread::JoinHandle<Result<bool>> {
        let coordinator = Arc::clone(&self.coordinator);
        thread::spawn(move || coordinator.rebuild())
    }

    /// Write the gallery to disk. Derived index state is not serialized;
    /// import retrains from the recorded seed.
    pub fn export_snapshot(&self, path: &Path) -> Result<()> {
        let snapshot = Snapshot {
            format_version: FORMAT_VERSION,
            dimension: self.config.dimension,
            norm_epsilon: self.config.norm_epsilon,
            index: self.config.index.clone(),
            next_embedding_id: self.store.next_id(),
            records: self.store.snapshot_active(),
        };
        persistence::write_snapshot(path, &snapshot)?;
        info!(path = %path.display(), records = snapshot.records.len(), "snapshot exported");
        Ok(())
    }

    /// Load a snapshot, adopting its dimension and index configuration.
    /// Matching thresholds come from `config`. The index is rebuilt before
    /// the engine is returned, so it serves immediately.
    pub fn import_snapshot(path: &Path, mut config: EngineConfig) -> Result<Self> {
        let snapshot = persistence::read_snapshot(path)?;
        config.dimension = snapshot.dimension;
        config.norm_epsilon = snapshot.norm_epsilon;
        config.index = snapshot.index;
        config.validate()?;

        let store = Arc::new(EmbeddingStore::restore(
            snapshot.dimension,
            snapshot.norm_epsilon,
            snapshot.records,
            snapshot.next_embedding_id,
        )?);
        let coordinator = Arc::new(IndexCoordinator::new(config.clone(), Arc::clone(&store))?);
        let engine = Self {
            config,
            store,
            coordinator,
            extractor: None,
            liveness: None,
        };
        engine.rebuild_now()?;
        info!(path = %path.display(), "snapshot imported");
        Ok(engine)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            persons: self.store.person_count(),
            active_embeddings: self.store.active_count(),
            index: self.coordinator.stats(),
        }
    }

    fn require_extractor(&self) -> Result<&Arc<dyn EmbeddingExtractor>> {
        self.extractor.as_ref().ok_or_else(|| {
            EngineError::InvalidArgument("no embedding extractor configured".to_string())
        })
    }

    fn check_liveness(&self, image: &[u8]) -> Result<()> {
        let (Some(liveness), Some(threshold)) =
            (self.liveness.as_ref(), self.config.liveness_threshold)
        else {
            return Ok(());
        };
        let confidence = liveness.score(image)?;
        if confidence < threshold {
            return Err(EngineError::LivenessRejected {
                confidence,
                threshold,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::testing::{StubExtractor, StubLiveness};
    use crate::vector::normalize;

    fn engine(dimension: usize) -> Engine {
        Engine::new(EngineConfig {
            dimension,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn enroll_rejects_low_quality() {
        let engine = engine(4);
        let v = normalize(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        let err = engine.enroll("alice", v, 0.3);
        assert!(matches!(err, Err(EngineError::QualityTooLow { .. })));
    }

    #[test]
    fn enroll_rejects_empty_person_id() {
        let engine = engine(4);
        let v = normalize(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        assert!(matches!(
            engine.enroll("", v, 0.9),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn batch_enrollment_reports_per_item_outcomes() {
        let engine = engine(4);
        let good = normalize(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        let outcomes = engine.enroll_batch(
            "alice",
            vec![
                EnrollmentItem {
                    vector: good.clone(),
                    quality: 0.9,
                },
                EnrollmentItem {
                    vector: good,
                    quality: 0.1,
                },
            ],
        );
        assert!(outcomes[0].is_ok());
        assert!(matches!(
            outcomes[1],
            Err(EngineError::QualityTooLow { .. })
        ));
        assert_eq!(engine.stats().active_embeddings, 1);
    }

    #[test]
    fn image_enrollment_applies_liveness_gate() {
        let config = EngineConfig {
            dimension: 4,
            liveness_threshold: Some(0.8),
            ..Default::default()
        };
        let engine = Engine::new(config)
            .unwrap()
            .with_extractor(Arc::new(StubExtractor {
                dimension: 4,
                quality: 0.9,
            }))
            .with_liveness(Arc::new(StubLiveness(0.4)));
        assert!(matches!(
            engine.enroll_image("alice", &[0u8]),
            Err(EngineError::LivenessRejected { .. })
        ));
    }

    #[test]
    fn image_identification_applies_quality_gate() {
        let config = EngineConfig {
            dimension: 4,
            probe_quality_threshold: Some(0.7),
            ..Default::default()
        };
        let engine = Engine::new(config)
            .unwrap()
            .with_extractor(Arc::new(StubExtractor {
                dimension: 4,
                quality: 0.4,
            }));
        assert!(matches!(
            engine.identify_image(&[0u8], &QueryOptions::default()),
            Err(EngineError::QualityTooLow { .. })
        ));
    }

    #[test]
    fn image_round_trip_identifies_enrolled_person() {
        let engine = engine(4).with_extractor(Arc::new(StubExtractor {
            dimension: 4,
            quality: 0.9,
        }));
        engine.enroll_image("alice", &[0u8]).unwrap();
        engine.enroll_image("bob", &[1u8]).unwrap();

        let matches = engine
            .identify_image(&[0u8], &QueryOptions::default())
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].person_id, "alice");
    }

    #[test]
    fn identify_on_empty_gallery_is_empty() {
        let engine = engine(4);
        let probe = normalize(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        assert!(engine
            .identify(&probe, &QueryOptions::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn verify_unknown_person_fails() {
        let engine = engine(4);
        let probe = normalize(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        assert!(matches!(
            engine.verify("ghost", &probe, None),
            Err(EngineError::PersonNotFound(_))
        ));
    }
}
