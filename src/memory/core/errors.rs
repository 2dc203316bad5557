//! Error types for the dialogue memory subsystem.

use deadpool_redis::redis::RedisError;
use thiserror::Error;

/// Memory subsystem error type.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Invalid configuration or unsupported values.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Identifier rejected by validation.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
    /// Malformed memory atom.
    #[error("invalid memory atom: {0}")]
    InvalidAtom(String),
    /// Embedding length does not match the configured index dimension.
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Dimension the index was configured with.
        expected: usize,
        /// Dimension received.
        got: usize,
    },
    /// A stored value could not be decoded.
    #[error("corrupt stored value at {key}: {reason}")]
    CorruptValue {
        /// Key holding the value.
        key: String,
        /// Decoding failure.
        reason: String,
    },
    /// Operation against a key holding the wrong kind of value.
    #[error("wrong value type at {0}")]
    WrongType(String),
    /// Redis command error.
    #[error("redis error: {0}")]
    Redis(#[from] RedisError),
    /// Redis pool checkout error.
    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),
    /// Redis pool construction error.
    #[error("redis pool creation error: {0}")]
    CreatePool(#[from] deadpool_redis::CreatePoolError),
    /// `SQLite` storage error (sync).
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// `SQLite` storage error (async).
    #[error("tokio-rusqlite error: {0}")]
    TokioSqlite(#[from] tokio_rusqlite::Error),
    /// Required `SQLite` extension not available.
    #[error("sqlite-vec extension is not available; load it before initializing the vector index")]
    SqliteVecUnavailable,
    /// Embedding error.
    #[error("embedding error: {0}")]
    Embedding(#[from] rig::embeddings::EmbeddingError),
    /// HTTP client error from Rig.
    #[error("http client error: {0}")]
    HttpClient(#[from] rig::http_client::Error),
    /// Completion error.
    #[error("completion error: {0}")]
    Completion(#[from] rig::completion::CompletionError),
    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// URL parse error.
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// An external collaborator returned an unusable answer.
    #[error("collaborator error: {0}")]
    Collaborator(String),
}

impl MemoryError {
    /// Build a [`MemoryError::CorruptValue`].
    #[must_use]
    pub fn corrupt(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::CorruptValue {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

/// Convenience result alias for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;
