//! Vector index abstraction and an in-process implementation.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::memory::core::atom::{AtomStatus, MemoryAtom};
use crate::memory::core::errors::{MemoryError, MemoryResult};
use crate::memory::core::ids::UserId;

/// Boxed future type for vector index operations.
pub type IndexFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One similarity search hit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VectorHit {
    /// Primary key of the atom.
    pub pk: i64,
    /// Cosine similarity in `[-1, 1]`.
    pub similarity: f64,
}

/// Storage of memory atoms with similarity search.
pub trait VectorIndex: Send + Sync {
    /// Embedding dimension accepted by the index.
    fn dims(&self) -> usize;

    /// Insert or overwrite atoms by primary key. Returns the number written.
    ///
    /// # Errors
    /// Returns an error if the index cannot persist the atoms.
    fn upsert(&self, atoms: Vec<MemoryAtom>) -> IndexFuture<'_, MemoryResult<usize>>;

    /// Most similar active atoms of `user`, best first.
    ///
    /// # Errors
    /// Returns an error if the query cannot be executed.
    fn search(
        &self,
        user: &UserId,
        query: Vec<f32>,
        limit: usize,
    ) -> IndexFuture<'_, MemoryResult<Vec<VectorHit>>>;

    /// Full rows for the given keys; unknown keys are skipped.
    ///
    /// # Errors
    /// Returns an error if the query cannot be executed.
    fn fetch(&self, pks: Vec<i64>) -> IndexFuture<'_, MemoryResult<Vec<MemoryAtom>>>;

    /// Every atom of `user` created at or after `since`.
    ///
    /// # Errors
    /// Returns an error if the query cannot be executed.
    fn query_user(
        &self,
        user: &UserId,
        since: Option<DateTime<Utc>>,
    ) -> IndexFuture<'_, MemoryResult<Vec<MemoryAtom>>>;
}

/// Cosine similarity of two vectors of equal length; 0 for zero vectors.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot = x.mul_add(y, dot);
        norm_a = x.mul_add(x, norm_a);
        norm_b = y.mul_add(y, norm_b);
    }
    if norm_a <= 0.0 || norm_b <= 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Brute-force in-process index.
#[derive(Debug)]
pub struct InMemoryVectorIndex {
    dims: usize,
    rows: DashMap<i64, MemoryAtom>,
}

impl InMemoryVectorIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            rows: DashMap::new(),
        }
    }

    /// Number of stored atoms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl VectorIndex for InMemoryVectorIndex {
    fn dims(&self) -> usize {
        self.dims
    }

    fn upsert(&self, atoms: Vec<MemoryAtom>) -> IndexFuture<'_, MemoryResult<usize>> {
        Box::pin(async move {
            let count = atoms.len();
            for atom in atoms {
                self.rows.insert(atom.pk, atom);
            }
            Ok(count)
        })
    }

    fn search(
        &self,
        user: &UserId,
        query: Vec<f32>,
        limit: usize,
    ) -> IndexFuture<'_, MemoryResult<Vec<VectorHit>>> {
        let user = user.clone();
        Box::pin(async move {
            if query.len() != self.dims {
                return Err(MemoryError::DimensionMismatch {
                    expected: self.dims,
                    got: query.len(),
                });
            }
            let mut hits: Vec<VectorHit> = self
                .rows
                .iter()
                .filter(|row| row.user_id == user && row.status == AtomStatus::Active)
                .map(|row| VectorHit {
                    pk: row.pk,
                    similarity: cosine_similarity(&query, &row.embedding),
                })
                .collect();
            hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
            hits.truncate(limit);
            Ok(hits)
        })
    }

    fn fetch(&self, pks: Vec<i64>) -> IndexFuture<'_, MemoryResult<Vec<MemoryAtom>>> {
        Box::pin(async move {
            Ok(pks
                .iter()
                .filter_map(|pk| self.rows.get(pk).map(|row| row.value().clone()))
                .collect())
        })
    }

    fn query_user(
        &self,
        user: &UserId,
        since: Option<DateTime<Utc>>,
    ) -> IndexFuture<'_, MemoryResult<Vec<MemoryAtom>>> {
        let user = user.clone();
        Box::pin(async move {
            let mut atoms: Vec<MemoryAtom> = self
                .rows
                .iter()
                .filter(|row| row.user_id == user)
                .filter(|row| since.is_none_or(|since| row.created_at >= since))
                .map(|row| row.value().clone())
                .collect();
            atoms.sort_by_key(|atom| atom.created_at);
            Ok(atoms)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::core::atom::AtomCandidate;

    fn atom(user: &str, nk: &str, embedding: Vec<f32>) -> MemoryAtom {
        AtomCandidate {
            norm_key: Some(nk.to_string()),
            text: format!("fact {nk}"),
            ..AtomCandidate::default()
        }
        .normalize()
        .unwrap()
        .into_atom(UserId::new(user).unwrap(), None, embedding, Utc::now())
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_search_scoped_to_user_and_active() {
        let index = InMemoryVectorIndex::new(2);
        let mut archived = atom("u1", "old", vec![1.0, 0.0]);
        archived.status = AtomStatus::Archived;
        index
            .upsert(vec![
                atom("u1", "close", vec![0.9, 0.1]),
                atom("u1", "far", vec![0.0, 1.0]),
                atom("u2", "other", vec![1.0, 0.0]),
                archived,
            ])
            .await
            .unwrap();

        let user = UserId::new("u1").unwrap();
        let hits = index.search(&user, vec![1.0, 0.0], 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].similarity > hits[1].similarity);

        let rows = index.fetch(vec![hits[0].pk, 42]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].norm_key, "close");

        assert!(index.search(&user, vec![1.0], 10).await.is_err());
        assert_eq!(index.query_user(&user, None).await.unwrap().len(), 3);
    }
}
