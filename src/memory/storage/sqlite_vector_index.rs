//! `SQLite` + sqlite-vec implementation of [`VectorIndex`].
//!
//! Embeddings are stored as JSON arrays and compared with
//! `vec_distance_cosine`; similarity is `1 - distance`.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::params_from_iter;
use tokio_rusqlite::Connection;
use tracing::debug;

use crate::memory::core::atom::{AtomStatus, MemoryAtom};
use crate::memory::core::errors::{MemoryError, MemoryResult};
use crate::memory::core::ids::{SessionId, UserId};
use crate::memory::storage::vector_index::{IndexFuture, VectorHit, VectorIndex};

const COLUMNS: &str = "pk, user_id, type, norm_key, text, importance, confidence, times_seen, \
                       status, source_session_id, created_at, updated_at, last_used_at, embedding";

/// Row as stored in `SQLite`.
#[derive(Clone, Debug)]
struct AtomRow {
    pk: i64,
    user_id: String,
    atom_type: String,
    norm_key: String,
    text: String,
    importance: i64,
    confidence: f64,
    times_seen: i64,
    status: String,
    source_session_id: Option<String>,
    created_at: i64,
    updated_at: i64,
    last_used_at: Option<i64>,
    embedding: String,
}

impl AtomRow {
    fn from_atom(atom: &MemoryAtom) -> MemoryResult<Self> {
        Ok(Self {
            pk: atom.pk,
            user_id: atom.user_id.to_string(),
            atom_type: atom.atom_type.clone(),
            norm_key: atom.norm_key.clone(),
            text: atom.text.clone(),
            importance: i64::from(atom.importance),
            confidence: f64::from(atom.confidence),
            times_seen: i64::from(atom.times_seen),
            status: atom.status.as_str().to_string(),
            source_session_id: atom.source_session_id.map(|id| id.to_string()),
            created_at: atom.created_at.timestamp_millis(),
            updated_at: atom.updated_at.timestamp_millis(),
            last_used_at: atom.last_used_at.map(|at| at.timestamp_millis()),
            embedding: serde_json::to_string(&atom.embedding)?,
        })
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            pk: row.get(0)?,
            user_id: row.get(1)?,
            atom_type: row.get(2)?,
            norm_key: row.get(3)?,
            text: row.get(4)?,
            importance: row.get(5)?,
            confidence: row.get(6)?,
            times_seen: row.get(7)?,
            status: row.get(8)?,
            source_session_id: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
            last_used_at: row.get(12)?,
            embedding: row.get(13)?,
        })
    }

    fn into_atom(self) -> MemoryResult<MemoryAtom> {
        let pk = self.pk;
        let invalid = |what: &str| MemoryError::InvalidAtom(format!("row {pk}: invalid {what}"));
        let source_session_id = match &self.source_session_id {
            Some(raw) if !raw.is_empty() => Some(
                raw.parse::<SessionId>()
                    .map_err(|_| invalid("source_session_id"))?,
            ),
            _ => None,
        };
        #[allow(clippy::cast_possible_truncation)]
        let confidence = self.confidence as f32;
        let last_used_at = match self.last_used_at {
            Some(ms) => Some(millis_to_datetime(ms).ok_or_else(|| invalid("last_used_at"))?),
            None => None,
        };
        Ok(MemoryAtom {
            pk: self.pk,
            user_id: UserId::new(&self.user_id)?,
            importance: u8::try_from(self.importance).map_err(|_| invalid("importance"))?,
            confidence,
            times_seen: u32::try_from(self.times_seen).map_err(|_| invalid("times_seen"))?,
            status: self.status.parse::<AtomStatus>()?,
            source_session_id,
            created_at: millis_to_datetime(self.created_at).ok_or_else(|| invalid("created_at"))?,
            updated_at: millis_to_datetime(self.updated_at).ok_or_else(|| invalid("updated_at"))?,
            last_used_at,
            embedding: serde_json::from_str(&self.embedding)?,
            atom_type: self.atom_type,
            norm_key: self.norm_key,
            text: self.text,
        })
    }
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

fn validate_table_name(table: &str) -> MemoryResult<()> {
    if table.is_empty()
        || !table
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
    {
        return Err(MemoryError::InvalidConfig(format!(
            "invalid table name {table:?}"
        )));
    }
    Ok(())
}

/// SQLite-backed vector index.
pub struct SqliteVectorIndex {
    conn: Connection,
    table: String,
    dims: usize,
}

impl SqliteVectorIndex {
    /// Open (and create if needed) the index at `path`.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or sqlite-vec is not loaded.
    ///
    /// # Note
    /// You must call `init_sqlite_vec_extension()` before calling this function.
    pub async fn open(path: impl AsRef<Path>, table: &str, dims: usize) -> MemoryResult<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        Self::from_connection(conn, table, dims).await
    }

    /// Build the index on an open connection.
    ///
    /// # Errors
    /// Returns an error if the schema cannot be created or sqlite-vec is not loaded.
    pub async fn from_connection(conn: Connection, table: &str, dims: usize) -> MemoryResult<Self> {
        validate_table_name(table)?;

        let has_vec = conn
            .call(|conn| {
                Ok(conn
                    .query_row("SELECT vec_version()", [], |row| row.get::<_, String>(0))
                    .is_ok())
            })
            .await?;
        if !has_vec {
            return Err(MemoryError::SqliteVecUnavailable);
        }

        let table_name = table.to_string();
        conn.call(move |conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table_name} (
                    pk INTEGER PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    type TEXT NOT NULL,
                    norm_key TEXT NOT NULL,
                    text TEXT NOT NULL,
                    importance INTEGER NOT NULL,
                    confidence REAL NOT NULL,
                    times_seen INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    source_session_id TEXT,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    last_used_at INTEGER,
                    embedding TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS {table_name}_user_status
                    ON {table_name} (user_id, status);
                CREATE INDEX IF NOT EXISTS {table_name}_user_created
                    ON {table_name} (user_id, created_at);"
            ))?;
            Ok(())
        })
        .await?;

        debug!(table, dims, "sqlite vector index ready");
        Ok(Self {
            conn,
            table: table.to_string(),
            dims,
        })
    }
}

impl VectorIndex for SqliteVectorIndex {
    fn dims(&self) -> usize {
        self.dims
    }

    fn upsert(&self, atoms: Vec<MemoryAtom>) -> IndexFuture<'_, MemoryResult<usize>> {
        Box::pin(async move {
            let rows = atoms
                .iter()
                .map(AtomRow::from_atom)
                .collect::<MemoryResult<Vec<_>>>()?;
            if rows.is_empty() {
                return Ok(0);
            }
            let table = self.table.clone();
            let written = self
                .conn
                .call(move |conn| {
                    let tx = conn.transaction()?;
                    {
                        let mut stmt = tx.prepare(&format!(
                            "INSERT OR REPLACE INTO {table} ({COLUMNS})
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                        ))?;
                        for row in &rows {
                            stmt.execute(rusqlite::params![
                                row.pk,
                                row.user_id,
                                row.atom_type,
                                row.norm_key,
                                row.text,
                                row.importance,
                                row.confidence,
                                row.times_seen,
                                row.status,
                                row.source_session_id,
                                row.created_at,
                                row.updated_at,
                                row.last_used_at,
                                row.embedding,
                            ])?;
                        }
                    }
                    tx.commit()?;
                    Ok(rows.len())
                })
                .await?;
            Ok(written)
        })
    }

    fn search(
        &self,
        user: &UserId,
        query: Vec<f32>,
        limit: usize,
    ) -> IndexFuture<'_, MemoryResult<Vec<VectorHit>>> {
        let user = user.to_string();
        Box::pin(async move {
            if query.len() != self.dims {
                return Err(MemoryError::DimensionMismatch {
                    expected: self.dims,
                    got: query.len(),
                });
            }
            let query = serde_json::to_string(&query)?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let table = self.table.clone();
            let hits = self
                .conn
                .call(move |conn| {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT pk, 1.0 - vec_distance_cosine(embedding, ?2) AS similarity
                         FROM {table}
                         WHERE user_id = ?1 AND status = 'active'
                         ORDER BY similarity DESC
                         LIMIT ?3"
                    ))?;
                    let rows = stmt.query_map(rusqlite::params![user, query, limit], |row| {
                        Ok(VectorHit {
                            pk: row.get(0)?,
                            similarity: row.get(1)?,
                        })
                    })?;
                    let mut hits = Vec::new();
                    for row in rows {
                        hits.push(row?);
                    }
                    Ok(hits)
                })
                .await?;
            Ok(hits)
        })
    }

    fn fetch(&self, pks: Vec<i64>) -> IndexFuture<'_, MemoryResult<Vec<MemoryAtom>>> {
        Box::pin(async move {
            if pks.is_empty() {
                return Ok(Vec::new());
            }
            let table = self.table.clone();
            let rows = self
                .conn
                .call(move |conn| {
                    let placeholders = vec!["?"; pks.len()].join(", ");
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {COLUMNS} FROM {table} WHERE pk IN ({placeholders})"
                    ))?;
                    let rows = stmt.query_map(params_from_iter(pks.iter()), AtomRow::from_row)?;
                    let mut out = Vec::new();
                    for row in rows {
                        out.push(row?);
                    }
                    Ok(out)
                })
                .await?;
            rows.into_iter().map(AtomRow::into_atom).collect()
        })
    }

    fn query_user(
        &self,
        user: &UserId,
        since: Option<DateTime<Utc>>,
    ) -> IndexFuture<'_, MemoryResult<Vec<MemoryAtom>>> {
        let user = user.to_string();
        let since_ms = since.map_or(i64::MIN, |at| at.timestamp_millis());
        Box::pin(async move {
            let table = self.table.clone();
            let rows = self
                .conn
                .call(move |conn| {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {COLUMNS} FROM {table}
                         WHERE user_id = ?1 AND created_at >= ?2
                         ORDER BY created_at ASC"
                    ))?;
                    let rows =
                        stmt.query_map(rusqlite::params![user, since_ms], AtomRow::from_row)?;
                    let mut out = Vec::new();
                    for row in rows {
                        out.push(row?);
                    }
                    Ok(out)
                })
                .await?;
            rows.into_iter().map(AtomRow::into_atom).collect()
        })
    }
}
