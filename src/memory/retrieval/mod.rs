//! Hybrid ranking of long-term memory hits.

pub mod ranking;

pub use ranking::{RankedMemory, rank_results, recency_weight, score_atom};
