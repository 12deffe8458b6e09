//! Tombstone set for logical deletion within an index generation.
//!
//! ANN structures have no efficient in-place delete. Removal marks the
//! vector id tombstoned; searches filter tombstones out, and the next
//! rebuild purges them by constructing a fresh generation from the store's
//! active records. Once the tombstoned fraction of the live index crosses a
//! threshold, the coordinator schedules that rebuild.

use std::collections::HashSet;

use crate::index::VectorId;

/// Set of logically deleted vector ids for one generation.
#[derive(Debug)]
pub struct TombstoneSet {
    deleted: HashSet<VectorId>,
    rebuild_threshold: f32,
}

impl TombstoneSet {
    /// `rebuild_threshold` is the fraction of the live index that may be
    /// tombstoned before a rebuild is recommended (e.g. 0.1 = 10%).
    pub fn new(rebuild_threshold: f32) -> Self {
        TombstoneSet {
            deleted: HashSet::new(),
            rebuild_threshold: rebuild_threshold.clamp(0.01, 1.0),
        }
    }

    /// Mark a vector id deleted. Returns true if it was newly deleted.
    pub fn delete(&mut self, vector_id: VectorId) -> bool {
        self.deleted.insert(vector_id)
    }

    #[inline]
    pub fn is_deleted(&self, vector_id: VectorId) -> bool {
        self.deleted.contains(&vector_id)
    }

    pub fn len(&self) -> usize {
        self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty()
    }

    /// Tombstoned fraction of `total_vectors`.
    pub fn ratio(&self, total_vectors: usize) -> f32 {
        if total_vectors == 0 {
            0.0
        } else {
            self.deleted.len() as f32 / total_vectors as f32
        }
    }

    /// Whether the tombstoned fraction exceeds the rebuild threshold.
    pub fn needs_rebuild(&self, total_vectors: usize) -> bool {
        self.ratio(total_vectors) > self.rebuild_threshold
    }

    /// Drop tombstoned entries from search results, preserving order.
    pub fn filter_results<'a>(
        &'a self,
        results: impl Iterator<Item = (VectorId, f32)> + 'a,
    ) -> impl Iterator<Item = (VectorId, f32)> + 'a {
        results.filter(move |(id, _)| !self.is_deleted(*id))
    }
}

impl Default for TombstoneSet {
    fn default() -> Self {
        Self::new(0.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_is_idempotent() {
        let mut ts = TombstoneSet::new(0.1);
        assert!(ts.delete(5));
        assert!(!ts.delete(5));
        assert!(ts.is_deleted(5));
        assert_eq!(ts.len(), 1);
    }

    #[test]
    fn filter_preserves_order() {
        let mut ts = TombstoneSet::new(0.1);
        ts.delete(2);
        ts.delete(4);

        let results = vec![(1, 0.9), (2, 0.8), (3, 0.7), (4, 0.6), (5, 0.5)];
        let filtered: Vec<_> = ts.filter_results(results.into_iter()).collect();
        assert_eq!(
            filtered.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            vec![1, 3, 5]
        );
    }

    #[test]
    fn rebuild_threshold_boundary() {
        let mut ts = TombstoneSet::new(0.1);
        for i in 0..10 {
            ts.delete(i);
        }
        // Exactly 10% does not trigger; strictly above does.
        assert!(!ts.needs_rebuild(100));
        ts.delete(10);
        assert!(ts.needs_rebuild(100));
        assert!(!ts.needs_rebuild(1000));
    }

    #[test]
    fn empty_index_never_needs_rebuild() {
        let mut ts = TombstoneSet::new(0.1);
        ts.delete(1);
        assert!(!ts.needs_rebuild(0));
        assert_eq!(ts.ratio(0), 0.0);
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_filter_drops_exactly_deleted(
            deletions in proptest::collection::vec(0u32..100, 0..20),
            results in proptest::collection::vec((0u32..100, 0.0f32..1.0), 0..50),
        ) {
            let mut ts = TombstoneSet::new(0.1);
            for id in &deletions {
                ts.delete(*id);
            }

            let filtered: Vec<_> = ts.filter_results(results.iter().cloned()).collect();
            for (id, _) in &filtered {
                prop_assert!(!ts.is_deleted(*id));
            }
            let deleted_count = results.iter().filter(|(id, _)| ts.is_deleted(*id)).count();
            prop_assert_eq!(filtered.len() + deleted_count, results.len());
        }

        #[test]
        fn prop_threshold_consistent(
            threshold in 0.01f32..0.5,
            deletions in 0u32..50,
            total in 50usize..500,
        ) {
            let mut ts = TombstoneSet::new(threshold);
            for i in 0..deletions {
                ts.delete(i);
            }
            let ratio = deletions as f32 / total as f32;
            prop_assert_eq!(ts.needs_rebuild(total), ratio > threshold);
        }
    }
}
