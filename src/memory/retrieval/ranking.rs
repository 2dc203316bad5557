//! Ranking utilities for retrieved memory atoms.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::memory::core::atom::MemoryAtom;
use crate::memory::core::config::ScoringConfig;
use crate::memory::storage::vector_index::VectorHit;

/// Ranked memory atom with score breakdown.
#[derive(Clone, Debug)]
pub struct RankedMemory {
    /// Final combined score.
    pub score: f64,
    /// Vector similarity score.
    pub similarity: f64,
    /// Recency score component.
    pub recency_score: f64,
    /// Importance score component.
    pub importance_score: f64,
    /// Usage frequency score component.
    pub frequency_score: f64,
    /// Memory atom.
    pub atom: MemoryAtom,
}

/// `exp(-age_days / half_life_days)`.
#[must_use]
pub fn recency_weight(age_days: f64, half_life_days: f64) -> f64 {
    (-age_days.max(0.0) / half_life_days.max(f64::MIN_POSITIVE)).exp()
}

/// Score one atom.
#[must_use]
pub fn score_atom(
    atom: MemoryAtom,
    similarity: f64,
    config: &ScoringConfig,
    half_life_days: f64,
    now: DateTime<Utc>,
) -> RankedMemory {
    #[allow(clippy::cast_precision_loss)]
    let age_days = now
        .signed_duration_since(atom.recency_anchor())
        .num_milliseconds()
        .max(0) as f64
        / 86_400_000.0;
    let recency_score = recency_weight(age_days, half_life_days);
    let importance_score = f64::from(atom.importance) / 5.0;
    let frequency_score = (f64::from(atom.times_seen) / 5.0).min(1.0);
    let score = config.w_frequency.mul_add(
        frequency_score,
        config.w_importance.mul_add(
            importance_score,
            config
                .w_recency
                .mul_add(recency_score, config.w_similarity * similarity),
        ),
    );

    RankedMemory {
        score,
        similarity,
        recency_score,
        importance_score,
        frequency_score,
        atom,
    }
}

/// Join hits with their rows, score them, keep the best atom per
/// `(type, norm_key)` and return the `top_k` best, highest score first.
#[must_use]
pub fn rank_results(
    hits: &[VectorHit],
    rows: Vec<MemoryAtom>,
    config: &ScoringConfig,
    half_life_days: f64,
    now: DateTime<Utc>,
    top_k: usize,
) -> Vec<RankedMemory> {
    let similarity_by_pk: HashMap<i64, f64> =
        hits.iter().map(|hit| (hit.pk, hit.similarity)).collect();

    let mut best: HashMap<(String, String), RankedMemory> = HashMap::new();
    for atom in rows {
        let Some(similarity) = similarity_by_pk.get(&atom.pk).copied() else {
            continue;
        };
        let ranked = score_atom(atom, similarity, config, half_life_days, now);
        let key = (ranked.atom.atom_type.clone(), ranked.atom.norm_key.clone());
        match best.get(&key) {
            Some(existing) if existing.score >= ranked.score => {}
            _ => {
                best.insert(key, ranked);
            }
        }
    }

    let mut ranked: Vec<RankedMemory> = best.into_values().collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    ranked.truncate(top_k);
    ranked
}
