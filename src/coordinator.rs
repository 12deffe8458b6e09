//! Index coordinator: generations, tombstones, and rebuilds.
//!
//! The store is the source of truth; the index is derived and rebuildable.
//! Each rebuild produces a fresh [`Generation`] holding an index, the
//! vector-id to embedding-id mapping, and a tombstone set. Readers load the
//! current generation through an [`ArcSwap`] pointer and never block on a
//! rebuild; in-flight searches keep their generation alive through the
//! `Arc` until they finish.
//!
//! Mutations during a rebuild are applied to the live generation and also
//! queued, then replayed into the new generation under the pending lock
//! just before the pointer swap. The swap is the single commit point:
//! observers see either the old generation or the new one with every
//! replayed mutation, never a half-rebuilt state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, IndexVariantConfig};
use crate::error::{EngineError, Result};
use crate::index::{AnyIndex, Deadline, FlatIndex, IvfPqIndex, VectorId, VectorIndex};
use crate::store::{EmbeddingId, EmbeddingStore};
use crate::tombstones::TombstoneSet;

/// Mutation queued while a rebuild is in flight.
#[derive(Debug, Clone)]
enum PendingOp {
    Insert(EmbeddingId, Vec<f32>),
    Remove(EmbeddingId),
}

/// Bidirectional map between dense per-generation vector ids and stable
/// embedding ids.
#[derive(Debug, Default)]
struct IdMap {
    forward: Vec<EmbeddingId>,
    reverse: HashMap<EmbeddingId, VectorId>,
}

impl IdMap {
    fn bind(&mut self, vector_id: VectorId, embedding_id: EmbeddingId) {
        debug_assert_eq!(vector_id as usize, self.forward.len());
        self.forward.push(embedding_id);
        self.reverse.insert(embedding_id, vector_id);
    }

    fn embedding_of(&self, vector_id: VectorId) -> Option<EmbeddingId> {
        self.forward.get(vector_id as usize).copied()
    }

    fn vector_of(&self, embedding_id: EmbeddingId) -> Option<VectorId> {
        self.reverse.get(&embedding_id).copied()
    }
}

/// One immutable-identity snapshot of the derived index.
pub struct Generation {
    id: u64,
    index: RwLock<AnyIndex>,
    ids: RwLock<IdMap>,
    tombstones: RwLock<TombstoneSet>,
}

impl Generation {
    fn attach(&self, embedding_id: EmbeddingId, vector: &[f32]) -> Result<()> {
        let mut index = self.index.write();
        let mut ids = self.ids.write();
        if ids.vector_of(embedding_id).is_some() {
            return Ok(());
        }
        match index.insert_one(vector) {
            Ok(vector_id) => {
                ids.bind(vector_id, embedding_id);
                Ok(())
            }
            // Untrained IVF-PQ defers the vector; the record stays in the
            // store and becomes searchable once a rebuild trains the index.
            Err(EngineError::IndexUnready) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn detach(&self, embedding_id: EmbeddingId) {
        let ids = self.ids.read();
        if let Some(vector_id) = ids.vector_of(embedding_id) {
            self.tombstones.write().delete(vector_id);
        }
    }

    fn tombstone_count(&self) -> usize {
        self.tombstones.read().len()
    }

    fn live_len(&self) -> usize {
        let total = self.index.read().len();
        total.saturating_sub(self.tombstone_count())
    }
}

/// Aggregate counters reported by [`IndexCoordinator::stats`].
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorStats {
    pub generation: u64,
    pub index_variant: &'static str,
    pub index_trained: bool,
    pub indexed_vectors: usize,
    pub tombstones: usize,
    pub tombstone_ratio: f32,
    pub rebuilding: bool,
}

/// Owns the generation pointer and the rebuild lifecycle.
pub struct IndexCoordinator {
    config: EngineConfig,
    store: Arc<EmbeddingStore>,
    current: ArcSwap<Generation>,
    pending: Mutex<Vec<PendingOp>>,
    rebuilding: AtomicBool,
    next_generation: AtomicU64,
}

impl IndexCoordinator {
    pub fn new(config: EngineConfig, store: Arc<EmbeddingStore>) -> Result<Self> {
        let index = build_index(&config)?;
        let generation = Generation {
            id: 0,
            index: RwLock::new(index),
            ids: RwLock::new(IdMap::default()),
            tombstones: RwLock::new(TombstoneSet::new(config.tombstone_rebuild_ratio)),
        };
        Ok(Self {
            config,
            store,
            current: ArcSwap::from_pointee(generation),
            pending: Mutex::new(Vec::new()),
            rebuilding: AtomicBool::new(false),
            next_generation: AtomicU64::new(1),
        })
    }

    /// Make a stored embedding visible to search.
    pub fn attach(&self, embedding_id: EmbeddingId, vector: &[f32]) -> Result<()> {
        // Queue first so a concurrent rebuild that has already snapshotted
        // the store still replays this insert into the new generation.
        {
            let mut pending = self.pending.lock();
            if self.rebuilding.load(Ordering::Acquire) {
                pending.push(PendingOp::Insert(embedding_id, vector.to_vec()));
            }
        }
        self.current.load().attach(embedding_id, vector)
    }

    /// Hide an embedding from search. Idempotent.
    pub fn detach(&self, embedding_id: EmbeddingId) {
        {
            let mut pending = self.pending.lock();
            if self.rebuilding.load(Ordering::Acquire) {
                pending.push(PendingOp::Remove(embedding_id));
            }
        }
        self.current.load().detach(embedding_id);
    }

    /// Top-k over live vectors, mapped back to embedding ids.
    ///
    /// Overfetches by the tombstone count so deletions cannot shrink the
    /// result set below `k` while live matches remain. An untrained IVF-PQ
    /// generation with enrolled records fails closed with `IndexUnready`
    /// rather than degrading to an exact scan; a rebuild clears it.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        deadline: Option<Deadline>,
    ) -> Result<Vec<(EmbeddingId, f32)>> {
        crate::index::validate_k(k)?;
        let generation = self.current.load();

        if !generation.index.read().is_trained() {
            if self.store.active_count() == 0 {
                return Ok(Vec::new());
            }
            return Err(EngineError::IndexUnready);
        }

        let overfetch = k.saturating_add(generation.tombstone_count());
        let raw = generation.index.read().search_top_k(query, overfetch, deadline)?;

        let ids = generation.ids.read();
        let tombstones = generation.tombstones.read();
        let mut results = Vec::with_capacity(k);
        for (vector_id, similarity) in tombstones.filter_results(raw.into_iter()) {
            if let Some(embedding_id) = ids.embedding_of(vector_id) {
                results.push((embedding_id, similarity));
                if results.len() == k {
                    break;
                }
            }
        }
        Ok(results)
    }

    /// Whether the current generation warrants a rebuild.
    pub fn needs_rebuild(&self) -> bool {
        let generation = self.current.load();
        let index = generation.index.read();
        let total = index.len();
        let untrained_backlog = !index.is_trained() && self.store.active_count() > 0;
        drop(index);
        untrained_backlog
            || generation.tombstones.read().needs_rebuild(total)
            || generation.index.read().needs_retrain()
    }

    pub fn is_rebuilding(&self) -> bool {
        self.rebuilding.load(Ordering::Acquire)
    }

    /// Rebuild the index from the store and atomically swap it in.
    ///
    /// Returns `Ok(false)` without doing work if a rebuild is already in
    /// flight. On error the previous generation stays current.
    pub fn rebuild(&self) -> Result<bool> {
        if self.rebuilding.swap(true, Ordering::AcqRel) {
            debug!("rebuild already in flight, skipping");
            return Ok(false);
        }

        let result = self.rebuild_inner();
        if let Err(e) = &result {
            self.rebuilding.store(false, Ordering::Release);
            self.pending.lock().clear();
            warn!(error = %e, "index rebuild failed, previous generation retained");
        }
        result
    }

    fn rebuild_inner(&self) -> Result<bool> {
        let generation_id = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let records = self.store.snapshot_active();
        debug!(
            generation = generation_id,
            records = records.len(),
            "rebuilding index"
        );

        let mut index = build_index(&self.config)?;
        let mut ids = IdMap::default();

        if !records.is_empty() {
            if let AnyIndex::IvfPq(ivf) = &mut index {
                let mut flat = Vec::with_capacity(records.len() * self.config.dimension);
                for record in &records {
                    flat.extend_from_slice(&record.vector);
                }
                // Training assigns every vector; ids follow record order.
                ivf.train(&flat, records.len())?;
                for (i, record) in records.iter().enumerate() {
                    ids.bind(i as VectorId, record.embedding_id);
                }
            } else {
                for record in &records {
                    let vector_id = index.insert_one(&record.vector)?;
                    ids.bind(vector_id, record.embedding_id);
                }
            }
        }

        let generation = Generation {
            id: generation_id,
            index: RwLock::new(index),
            ids: RwLock::new(ids),
            tombstones: RwLock::new(TombstoneSet::new(self.config.tombstone_rebuild_ratio)),
        };

        // Commit: drain queued mutations into the new generation, swap the
        // pointer, and clear the rebuilding flag, all under the pending
        // lock so no mutation lands in neither generation.
        let mut pending = self.pending.lock();
        for op in pending.drain(..) {
            match op {
                // attach() already skips duplicates, so an insert that made
                // it into the snapshot replays as a no-op.
                PendingOp::Insert(embedding_id, vector) => {
                    generation.attach(embedding_id, &vector)?;
                }
                PendingOp::Remove(embedding_id) => generation.detach(embedding_id),
            }
        }
        let live = generation.live_len();
        let id = generation.id;
        self.current.store(Arc::new(generation));
        self.rebuilding.store(false, Ordering::Release);
        drop(pending);

        info!(generation = id, live_vectors = live, "index rebuild committed");
        Ok(true)
    }

    pub fn stats(&self) -> CoordinatorStats {
        let generation = self.current.load();
        let index = generation.index.read();
        let total = index.len();
        let tombstones = generation.tombstone_count();
        let tombstone_ratio = generation.tombstones.read().ratio(total);
        CoordinatorStats {
            generation: generation.id,
            index_variant: index.variant_name(),
            index_trained: index.is_trained(),
            indexed_vectors: total,
            tombstones,
            tombstone_ratio,
            rebuilding: self.is_rebuilding(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

fn build_index(config: &EngineConfig) -> Result<AnyIndex> {
    Ok(match &config.index {
        IndexVariantConfig::Flat => AnyIndex::Flat(FlatIndex::new(config.dimension)?),
        IndexVariantConfig::IvfPq(params) => {
            AnyIndex::IvfPq(IvfPqIndex::new(config.dimension, params.clone())?)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IvfPqParams;
    use crate::vector::normalize;

    fn flat_setup(dimension: usize) -> (Arc<EmbeddingStore>, IndexCoordinator) {
        let config = EngineConfig {
            dimension,
            ..Default::default()
        };
        let store = Arc::new(EmbeddingStore::new(dimension, config.norm_epsilon));
        let coordinator = IndexCoordinator::new(config, Arc::clone(&store)).unwrap();
        (store, coordinator)
    }

    fn enroll(
        store: &EmbeddingStore,
        coordinator: &IndexCoordinator,
        person: &str,
        vector: &[f32],
    ) -> EmbeddingId {
        let unit = normalize(vector).unwrap();
        let id = store.insert(person, unit.clone(), 0.9).unwrap();
        coordinator.attach(id, &unit).unwrap();
        id
    }

    #[test]
    fn search_maps_back_to_embedding_ids() {
        let (store, coordinator) = flat_setup(4);
        let alice = enroll(&store, &coordinator, "alice", &[1.0, 0.0, 0.0, 0.0]);
        let _bob = enroll(&store, &coordinator, "bob", &[0.0, 1.0, 0.0, 0.0]);

        let probe = normalize(&[1.0, 0.1, 0.0, 0.0]).unwrap();
        let results = coordinator.search(&probe, 1, None).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, alice);
    }

    #[test]
    fn detach_hides_embedding_without_shrinking_top_k() {
        let (store, coordinator) = flat_setup(4);
        let alice = enroll(&store, &coordinator, "alice", &[1.0, 0.0, 0.0, 0.0]);
        let bob = enroll(&store, &coordinator, "bob", &[0.9, 0.1, 0.0, 0.0]);
        let carol = enroll(&store, &coordinator, "carol", &[0.8, 0.2, 0.0, 0.0]);

        coordinator.detach(alice);
        let probe = normalize(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        let results = coordinator.search(&probe, 2, None).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, bob);
        assert_eq!(results[1].0, carol);
    }

    #[test]
    fn stats_report_tombstone_ratio() {
        let (store, coordinator) = flat_setup(4);
        let alice = enroll(&store, &coordinator, "alice", &[1.0, 0.0, 0.0, 0.0]);
        for i in 0..3 {
            let v = [0.0, 1.0, i as f32 * 0.1, 0.0];
            enroll(&store, &coordinator, &format!("p{i}"), &v);
        }
        coordinator.detach(alice);

        let stats = coordinator.stats();
        assert_eq!(stats.indexed_vectors, 4);
        assert_eq!(stats.tombstones, 1);
        assert!((stats.tombstone_ratio - 0.25).abs() < 1e-6);
        assert!(!stats.rebuilding);
    }

    #[test]
    fn detach_is_idempotent() {
        let (store, coordinator) = flat_setup(4);
        let alice = enroll(&store, &coordinator, "alice", &[1.0, 0.0, 0.0, 0.0]);
        coordinator.detach(alice);
        coordinator.detach(alice);
        assert_eq!(coordinator.stats().tombstones, 1);
    }

    #[test]
    fn rebuild_compacts_tombstones() {
        let (store, coordinator) = flat_setup(4);
        let alice = enroll(&store, &coordinator, "alice", &[1.0, 0.0, 0.0, 0.0]);
        let bob = enroll(&store, &coordinator, "bob", &[0.0, 1.0, 0.0, 0.0]);

        store.deactivate(alice).unwrap();
        coordinator.detach(alice);

        assert!(coordinator.rebuild().unwrap());
        let stats = coordinator.stats();
        assert_eq!(stats.indexed_vectors, 1);
        assert_eq!(stats.tombstones, 0);
        assert_eq!(stats.generation, 1);

        let probe = normalize(&[0.5, 0.5, 0.0, 0.0]).unwrap();
        let results = coordinator.search(&probe, 2, None).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, bob);
    }

    #[test]
    fn tombstone_ratio_requests_rebuild() {
        let (store, coordinator) = flat_setup(4);
        let mut ids = Vec::new();
        for i in 0..10 {
            let v = [1.0, i as f32 * 0.1, 0.0, 0.0];
            ids.push(enroll(&store, &coordinator, &format!("p{i}"), &v));
        }
        assert!(!coordinator.needs_rebuild());
        coordinator.detach(ids[0]);
        coordinator.detach(ids[1]);
        assert!(coordinator.needs_rebuild());
    }

    fn ivf_config(dimension: usize) -> EngineConfig {
        EngineConfig {
            dimension,
            index: IndexVariantConfig::IvfPq(IvfPqParams {
                nlist: 4,
                n_probe: 4,
                num_codebooks: 2,
                codebook_size: 16,
                train_seed: 42,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn untrained_ivf_pq_fails_closed_until_rebuild() {
        let config = ivf_config(4);
        let store = Arc::new(EmbeddingStore::new(4, config.norm_epsilon));
        let coordinator = IndexCoordinator::new(config, Arc::clone(&store)).unwrap();
        let probe = normalize(&[1.0, 0.1, 0.0, 0.0]).unwrap();

        // Empty gallery: nothing to find, not an error.
        assert!(coordinator.search(&probe, 1, None).unwrap().is_empty());

        let alice = enroll(&store, &coordinator, "alice", &[1.0, 0.0, 0.0, 0.0]);
        let _bob = enroll(&store, &coordinator, "bob", &[0.0, 1.0, 0.0, 0.0]);

        // Enrolled backlog with no trained index: refuse to serve rather
        // than degrade to an exact scan.
        assert!(!coordinator.stats().index_trained);
        assert!(matches!(
            coordinator.search(&probe, 1, None),
            Err(EngineError::IndexUnready)
        ));

        assert!(coordinator.needs_rebuild());
        assert!(coordinator.rebuild().unwrap());
        assert!(coordinator.stats().index_trained);
        let results = coordinator.search(&probe, 1, None).unwrap();
        assert_eq!(results[0].0, alice);
    }

    #[test]
    fn repeated_rebuild_advances_generation() {
        let (store, coordinator) = flat_setup(4);
        let alice = enroll(&store, &coordinator, "alice", &[1.0, 0.0, 0.0, 0.0]);
        assert!(coordinator.rebuild().unwrap());
        let before = coordinator.stats().generation;

        // A second rebuild over the same data succeeds and advances.
        assert!(coordinator.rebuild().unwrap());
        assert!(coordinator.stats().generation > before);
        let probe = normalize(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        assert_eq!(coordinator.search(&probe, 1, None).unwrap()[0].0, alice);
    }
}
