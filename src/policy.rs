//! Matching policy: turns raw index hits into identification and
//! verification decisions.
//!
//! The index ranks individual embeddings; people enroll several. Policy
//! collapses hits to one candidate per person (their best embedding),
//! applies the similarity threshold, and truncates to top-k. Verification
//! never touches the index: it compares the probe against the person's
//! stored embeddings exactly.

use serde::{Deserialize, Serialize};

use crate::store::EmbeddingId;

/// One index hit joined back to its record metadata.
#[derive(Debug, Clone)]
pub struct RawHit {
    pub embedding_id: EmbeddingId,
    pub person_id: String,
    pub similarity: f32,
    pub created_at_us: u64,
}

/// One identification candidate, already deduplicated per person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonMatch {
    pub person_id: String,
    /// The person's best-matching embedding.
    pub embedding_id: EmbeddingId,
    pub similarity: f32,
}

/// Result of a 1:1 verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub person_id: String,
    pub matched: bool,
    /// Highest similarity across the person's active embeddings.
    pub best_similarity: f32,
    pub threshold: f32,
    /// How many embeddings were compared.
    pub compared: usize,
}

/// Collapse raw hits to at most one candidate per person, keep those at or
/// above `threshold`, rank by descending similarity, and truncate to `top_k`.
///
/// Per person the highest-similarity hit wins; exact similarity ties go to
/// the most recently enrolled embedding. Cross-person similarity ties rank
/// by person id so output order is stable.
pub fn rank_candidates(hits: Vec<RawHit>, threshold: f32, top_k: usize) -> Vec<PersonMatch> {
    let mut best: Vec<RawHit> = Vec::new();
    for hit in hits {
        if hit.similarity < threshold {
            continue;
        }
        match best.iter_mut().find(|b| b.person_id == hit.person_id) {
            Some(existing) => {
                let newer_tie = hit.similarity == existing.similarity
                    && hit.created_at_us > existing.created_at_us;
                if hit.similarity > existing.similarity || newer_tie {
                    *existing = hit;
                }
            }
            None => best.push(hit),
        }
    }

    best.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| a.person_id.cmp(&b.person_id))
    });
    best.truncate(top_k);
    best.into_iter()
        .map(|hit| PersonMatch {
            person_id: hit.person_id,
            embedding_id: hit.embedding_id,
            similarity: hit.similarity,
        })
        .collect()
}

/// Decide a verification from exact per-embedding similarities.
pub fn verify_outcome(
    person_id: String,
    similarities: &[f32],
    threshold: f32,
) -> VerificationOutcome {
    let best_similarity = similarities
        .iter()
        .copied()
        .fold(f32::NEG_INFINITY, f32::max);
    VerificationOutcome {
        person_id,
        matched: best_similarity >= threshold,
        best_similarity,
        threshold,
        compared: similarities.len(),
    }
}
