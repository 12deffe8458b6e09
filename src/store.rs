//! Durable record store for enrolled embeddings.
//!
//! The store is the source of truth for what should be searchable. The ANN
//! index is a derived, rebuildable cache of this store's active records;
//! protecting that relationship is the central invariant of the engine.
//!
//! Records are immutable once created, except for the active flag. Removal
//! deactivates; nothing is physically purged until a rebuild drops the old
//! generation.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::vector;

/// Stable identifier for one enrolled embedding, monotonically increasing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct EmbeddingId(pub u64);

impl fmt::Display for EmbeddingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One enrolled embedding: a unit vector plus identity and quality metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub embedding_id: EmbeddingId,
    pub person_id: String,
    pub vector: Vec<f32>,
    pub quality: f32,
    /// Enrollment time, microseconds since the Unix epoch.
    pub created_at_us: u64,
    pub active: bool,
}

#[derive(Debug, Default)]
struct StoreInner {
    records: BTreeMap<EmbeddingId, EmbeddingRecord>,
    next_id: u64,
}

/// Mapping from embedding ids to records, single writer of identity truth.
///
/// All writes go through one write lock, which also serializes concurrent
/// enrollments for the same person. Reads (resolution, rebuild snapshots)
/// take the read lock and may run concurrently.
#[derive(Debug)]
pub struct EmbeddingStore {
    inner: RwLock<StoreInner>,
    dimension: usize,
    norm_epsilon: f32,
}

impl EmbeddingStore {
    pub fn new(dimension: usize, norm_epsilon: f32) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            dimension,
            norm_epsilon,
        }
    }

    /// Insert a new record, assigning the next monotonic embedding id.
    ///
    /// Fails with `DimensionMismatch`/`InvalidVector` if the vector does not
    /// match the configured dimension or deviates from unit norm.
    pub fn insert(
        &self,
        person_id: impl Into<String>,
        vector: Vec<f32>,
        quality: f32,
    ) -> Result<EmbeddingId> {
        vector::validate_unit(&vector, self.dimension, self.norm_epsilon)?;
        if !(0.0..=1.0).contains(&quality) {
            return Err(EngineError::InvalidArgument(format!(
                "quality {quality} must be in [0, 1]"
            )));
        }

        let mut inner = self.inner.write();
        let id = EmbeddingId(inner.next_id);
        inner.next_id += 1;
        inner.records.insert(
            id,
            EmbeddingRecord {
                embedding_id: id,
                person_id: person_id.into(),
                vector,
                quality,
                created_at_us: unix_micros(),
                active: true,
            },
        );
        Ok(id)
    }

    /// Deactivate a record. Idempotent: deactivating an already-inactive
    /// record is `Ok(())`. Fails with `NotFound` only if the id was never
    /// issued.
    pub fn deactivate(&self, id: EmbeddingId) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.records.get_mut(&id) {
            Some(record) => {
                record.active = false;
                Ok(())
            }
            None => Err(EngineError::NotFound(id)),
        }
    }

    /// Fetch a record by id (active or not).
    pub fn get(&self, id: EmbeddingId) -> Option<EmbeddingRecord> {
        self.inner.read().records.get(&id).cloned()
    }

    /// Active records for one person, ordered by enrollment time ascending.
    ///
    /// Embedding ids are assigned in creation order, so iterating the id-keyed
    /// map yields `created_at` order without a sort.
    pub fn list_active(&self, person_id: &str) -> Vec<EmbeddingRecord> {
        self.inner
            .read()
            .records
            .values()
            .filter(|r| r.active && r.person_id == person_id)
            .cloned()
            .collect()
    }

    /// Consistent point-in-time copy of all active records. Used by rebuild.
    pub fn snapshot_active(&self) -> Vec<EmbeddingRecord> {
        self.inner
            .read()
            .records
            .values()
            .filter(|r| r.active)
            .cloned()
            .collect()
    }

    /// Number of active records.
    pub fn active_count(&self) -> usize {
        self.inner
            .read()
            .records
            .values()
            .filter(|r| r.active)
            .count()
    }

    /// Number of distinct persons with at least one active record.
    pub fn person_count(&self) -> usize {
        let inner = self.inner.read();
        let mut persons: Vec<&str> = inner
            .records
            .values()
            .filter(|r| r.active)
            .map(|r| r.person_id.as_str())
            .collect();
        persons.sort_unstable();
        persons.dedup();
        persons.len()
    }

    /// Next id the store would assign. Recorded in snapshots so imported
    /// stores keep ids monotonic.
    pub fn next_id(&self) -> u64 {
        self.inner.read().next_id
    }

    /// Restore a store from snapshot records. Ids are preserved; the id
    /// counter resumes at `next_id`.
    pub fn restore(
        dimension: usize,
        norm_epsilon: f32,
        records: Vec<EmbeddingRecord>,
        next_id: u64,
    ) -> Result<Self> {
        let store = Self::new(dimension, norm_epsilon);
        {
            let mut inner = store.inner.write();
            for record in records {
                vector::validate_unit(&record.vector, dimension, norm_epsilon)?;
                if record.embedding_id.0 >= next_id {
                    return Err(EngineError::Snapshot(format!(
                        "record id {} is not below next_id {}",
                        record.embedding_id, next_id
                    )));
                }
                inner.records.insert(record.embedding_id, record);
            }
            inner.next_id = next_id;
        }
        Ok(store)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
