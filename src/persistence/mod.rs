//! Snapshot export and import.
//!
//! A snapshot captures the store (the source of truth) plus enough
//! configuration to rebuild the derived index deterministically. PQ
//! codebooks and centroids are not serialized; an import retrains from the
//! recorded seed, which yields the same structure for the same records.

pub mod format;

pub use format::{read_snapshot, write_snapshot, Snapshot, FORMAT_VERSION};
