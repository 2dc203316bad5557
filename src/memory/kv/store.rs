//! Key-value transaction store abstraction.
//!
//! Every piece of per-user conversational state lives behind this trait so
//! that any worker process can serve any user. The operations mirror the Redis
//! subset the engine relies on: strings with TTL, lists, set-if-absent, prefix
//! scans and optimistic watch-then-commit transactions.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::memory::core::errors::{MemoryError, MemoryResult};

/// Boxed future type for key-value operations.
pub type KvFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One write queued inside a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KvWrite {
    /// Set a string value, optionally with a TTL.
    Set {
        /// Target key.
        key: String,
        /// New value.
        value: String,
        /// Expiry; `None` persists the key.
        ttl: Option<Duration>,
    },
    /// Delete a key.
    Delete {
        /// Target key.
        key: String,
    },
}

impl KvWrite {
    /// Shorthand for a persistent set.
    #[must_use]
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
            ttl: None,
        }
    }

    /// Shorthand for a set with expiry.
    #[must_use]
    pub fn set_with_ttl(key: impl Into<String>, value: impl Into<String>, ttl: Duration) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
            ttl: Some(ttl),
        }
    }

    /// Shorthand for a delete.
    #[must_use]
    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }
}

/// Transaction body.
///
/// Receives the current values of the watched keys, in order. Returning `None`
/// aborts without writing; returning writes queues them for atomic commit.
pub type TxnPlan = Box<dyn FnOnce(&[Option<String>]) -> Option<Vec<KvWrite>> + Send>;

/// Error slot shared between a [`TxnPlan`] and its caller.
///
/// A plan can only abort; recording the reason here lets the caller tell a
/// corrupt watched value apart from a lost race.
#[derive(Clone, Default)]
pub struct PlanFault(Arc<Mutex<Option<MemoryError>>>);

impl PlanFault {
    /// Record why the plan aborted.
    pub fn record(&self, err: MemoryError) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = Some(err);
        }
    }

    /// Return the recorded error, if any.
    ///
    /// # Errors
    /// Returns the error recorded by the plan.
    pub fn check(&self) -> MemoryResult<()> {
        match self.0.lock().ok().and_then(|mut slot| slot.take()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Key-value store used for all per-user conversational state.
pub trait KvStore: Send + Sync {
    /// Read a string value.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable or the key holds a list.
    fn get(&self, key: &str) -> KvFuture<'_, MemoryResult<Option<String>>>;

    /// Read several string values at once. Missing keys yield `None`.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    fn get_many(&self, keys: Vec<String>) -> KvFuture<'_, MemoryResult<Vec<Option<String>>>>;

    /// Write a string value, replacing any previous value and TTL.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> KvFuture<'_, MemoryResult<()>>;

    /// Write a string value only if the key does not exist.
    ///
    /// Returns `true` if this call created the key.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> KvFuture<'_, MemoryResult<bool>>;

    /// Delete keys, returning how many existed.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    fn delete(&self, keys: Vec<String>) -> KvFuture<'_, MemoryResult<u64>>;

    /// Whether a key exists.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    fn exists(&self, key: &str) -> KvFuture<'_, MemoryResult<bool>>;

    /// Append to a list and (re)set its TTL. Returns the new length.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable or the key holds a string.
    fn push_back(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> KvFuture<'_, MemoryResult<u64>>;

    /// List length; 0 for a missing key.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable or the key holds a string.
    fn list_len(&self, key: &str) -> KvFuture<'_, MemoryResult<u64>>;

    /// Inclusive range with Redis `LRANGE` index semantics (negative indices
    /// count from the end).
    ///
    /// # Errors
    /// Returns an error if the store is unreachable or the key holds a string.
    fn list_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> KvFuture<'_, MemoryResult<Vec<String>>>;

    /// Atomically read the whole list and delete it.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable or the key holds a string.
    fn drain_list(&self, key: &str) -> KvFuture<'_, MemoryResult<Vec<String>>>;

    /// All keys starting with `prefix`.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    fn scan_keys(&self, prefix: &str) -> KvFuture<'_, MemoryResult<Vec<String>>>;

    /// Optimistic transaction.
    ///
    /// Watches `keys`, reads their values, runs `plan` and commits its writes
    /// atomically. Returns `false` when the plan aborted or any watched key
    /// changed between the read and the commit; nothing is written then.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    fn watch_and_commit(
        &self,
        keys: Vec<String>,
        plan: TxnPlan,
    ) -> KvFuture<'_, MemoryResult<bool>>;
}
