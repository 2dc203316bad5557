//! Long-term memory store: idempotent atom upsert and ranked retrieval.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::memory::core::atom::{
    AtomCandidate, AtomStatus, MemoryAtom, atom_primary_key, auto_norm_key,
};
use crate::memory::core::config::{RetrievalConfig, ScoringConfig};
use crate::memory::core::errors::{MemoryError, MemoryResult};
use crate::memory::core::ids::{SessionId, UserId};
use crate::memory::embedding::Embedder;
use crate::memory::retrieval::ranking::{RankedMemory, rank_results};
use crate::memory::storage::vector_index::VectorIndex;

/// Render atoms as a bullet list, one `- text` line each.
#[must_use]
pub fn render_memory_pack<'a>(texts: impl IntoIterator<Item = &'a str>) -> String {
    texts
        .into_iter()
        .map(|text| format!("- {}", text.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Long-term memory facade over a [`VectorIndex`].
#[derive(Clone)]
pub struct LongTermMemory {
    index: Arc<dyn VectorIndex>,
    retrieval: RetrievalConfig,
    scoring: ScoringConfig,
}

impl LongTermMemory {
    /// Create a store over `index`.
    #[must_use]
    pub fn new(index: Arc<dyn VectorIndex>, retrieval: RetrievalConfig, scoring: ScoringConfig) -> Self {
        Self {
            index,
            retrieval,
            scoring,
        }
    }

    /// Retrieval settings.
    #[must_use]
    pub const fn retrieval_config(&self) -> &RetrievalConfig {
        &self.retrieval
    }

    /// Scoring settings.
    #[must_use]
    pub const fn scoring_config(&self) -> &ScoringConfig {
        &self.scoring
    }

    /// Upsert atoms for `user`, overwriting by primary key.
    ///
    /// The primary key is re-derived from `(user, type, norm_key)` and a
    /// missing norm key is generated from the text. Every atom is validated
    /// before the index is touched.
    ///
    /// # Errors
    /// Returns [`MemoryError::InvalidAtom`] or [`MemoryError::DimensionMismatch`]
    /// without writing anything, or the index error.
    pub async fn upsert(&self, user: &UserId, atoms: Vec<MemoryAtom>) -> MemoryResult<usize> {
        if atoms.is_empty() {
            return Ok(0);
        }
        let dims = self.index.dims();
        let mut prepared = Vec::with_capacity(atoms.len());
        for mut atom in atoms {
            if &atom.user_id != user {
                return Err(MemoryError::InvalidAtom(format!(
                    "atom owned by {} upserted for {user}",
                    atom.user_id
                )));
            }
            if atom.norm_key.trim().is_empty() {
                atom.norm_key = auto_norm_key(&atom.text);
            }
            atom.pk = atom_primary_key(user, &atom.atom_type, &atom.norm_key);
            atom.validate(dims)?;
            prepared.push(atom);
        }
        let written = self.index.upsert(prepared).await?;
        debug!(user = %user, written, "memory atoms upserted");
        Ok(written)
    }

    /// Normalize extracted candidates, embed them and upsert the result.
    ///
    /// # Errors
    /// Returns an error if embedding, validation or the index write fails.
    pub async fn remember(
        &self,
        user: &UserId,
        candidates: Vec<AtomCandidate>,
        embedder: &dyn Embedder,
        session: Option<SessionId>,
        now: DateTime<Utc>,
    ) -> MemoryResult<usize> {
        let drafts: Vec<_> = candidates
            .into_iter()
            .filter_map(AtomCandidate::normalize)
            .collect();
        if drafts.is_empty() {
            return Ok(0);
        }
        let inputs = drafts.iter().map(|draft| draft.embedding_input()).collect();
        let embeddings = embedder.embed_texts(inputs).await?;
        if embeddings.len() != drafts.len() {
            return Err(MemoryError::Collaborator(format!(
                "embedder returned {} vectors for {} texts",
                embeddings.len(),
                drafts.len()
            )));
        }
        let atoms = drafts
            .into_iter()
            .zip(embeddings)
            .map(|(draft, embedding)| draft.into_atom(user.clone(), session, embedding, now))
            .collect();
        self.upsert(user, atoms).await
    }

    /// Search, filter, score, dedupe and rank, without side effects.
    ///
    /// # Errors
    /// Returns an error if the query vector has the wrong dimension or the
    /// index fails.
    pub async fn retrieve_ranked(
        &self,
        user: &UserId,
        query: Vec<f32>,
        top_k: usize,
        min_similarity: f64,
        half_life_days: f64,
        now: DateTime<Utc>,
    ) -> MemoryResult<Vec<RankedMemory>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let limit = self.retrieval.candidate_limit(top_k);
        let hits: Vec<_> = self
            .index
            .search(user, query, limit)
            .await?
            .into_iter()
            .filter(|hit| hit.similarity >= min_similarity)
            .collect();
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let rows = self
            .index
            .fetch(hits.iter().map(|hit| hit.pk).collect())
            .await?
            .into_iter()
            .filter(|atom| &atom.user_id == user && atom.status == AtomStatus::Active)
            .collect();

        Ok(rank_results(
            &hits,
            rows,
            &self.scoring,
            half_life_days,
            now,
            top_k,
        ))
    }

    /// Retrieve the memory pack for a query vector.
    ///
    /// Returns an empty string when nothing relevant survives. Usage stats of
    /// the returned atoms are updated on a best-effort basis.
    ///
    /// # Errors
    /// Returns an error if the search itself fails.
    pub async fn retrieve(
        &self,
        user: &UserId,
        query: Vec<f32>,
        top_k: usize,
        min_similarity: f64,
        half_life_days: f64,
    ) -> MemoryResult<String> {
        let now = Utc::now();
        let ranked = self
            .retrieve_ranked(user, query, top_k, min_similarity, half_life_days, now)
            .await?;
        if ranked.is_empty() {
            return Ok(String::new());
        }

        if let Err(err) = self.record_usage(&ranked, now).await {
            warn!(user = %user, error = %err, "memory usage update failed");
        }

        Ok(render_memory_pack(
            ranked.iter().map(|item| item.atom.text.as_str()),
        ))
    }

    /// [`Self::retrieve`] with the configured `top_k`, threshold and half-life.
    ///
    /// # Errors
    /// Returns an error if the search itself fails.
    pub async fn retrieve_default(&self, user: &UserId, query: Vec<f32>) -> MemoryResult<String> {
        self.retrieve(
            user,
            query,
            self.retrieval.top_k,
            self.retrieval.min_similarity,
            self.scoring.recency_half_life_days,
        )
        .await
    }

    async fn record_usage(&self, ranked: &[RankedMemory], now: DateTime<Utc>) -> MemoryResult<usize> {
        let touched = ranked
            .iter()
            .map(|item| {
                let mut atom = item.atom.clone();
                atom.times_seen = atom.times_seen.saturating_add(1);
                atom.last_used_at = Some(now);
                atom
            })
            .collect();
        self.index.upsert(touched).await
    }

    /// Active atoms created within the last `days`, newest `top_k`, rendered
    /// oldest first.
    ///
    /// # Errors
    /// Returns an error if the index query fails.
    pub async fn recent(
        &self,
        user: &UserId,
        top_k: usize,
        days: i64,
        now: DateTime<Utc>,
    ) -> MemoryResult<String> {
        if top_k == 0 {
            return Ok(String::new());
        }
        let since = now - Duration::days(days.max(0));
        let mut atoms: Vec<_> = self
            .index
            .query_user(user, Some(since))
            .await?
            .into_iter()
            .filter(|atom| atom.status == AtomStatus::Active)
            .collect();
        atoms.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        atoms.truncate(top_k);
        atoms.reverse();
        Ok(render_memory_pack(atoms.iter().map(|atom| atom.text.as_str())))
    }

    /// Set the status of one atom. Returns `false` if `user` owns no atom
    /// with that key.
    ///
    /// # Errors
    /// Returns an error if the index read or write fails.
    pub async fn retire(&self, user: &UserId, pk: i64, status: AtomStatus) -> MemoryResult<bool> {
        let Some(mut atom) = self
            .index
            .fetch(vec![pk])
            .await?
            .into_iter()
            .find(|atom| &atom.user_id == user)
        else {
            return Ok(false);
        };
        atom.status = status;
        atom.updated_at = Utc::now();
        self.index.upsert(vec![atom]).await?;
        debug!(user = %user, pk, status = status.as_str(), "memory atom status changed");
        Ok(true)
    }
}
