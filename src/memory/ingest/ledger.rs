//! Per-user conversation history.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::memory::core::errors::MemoryResult;
use crate::memory::core::ids::UserId;
use crate::memory::ingest::activity::ActivityTracker;
use crate::memory::ingest::turn::ConversationTurn;
use crate::memory::kv::keys;
use crate::memory::kv::store::KvStore;

/// Append-only, TTL-bounded list of conversation turns per user.
#[derive(Clone)]
pub struct HistoryLedger {
    kv: Arc<dyn KvStore>,
    data_ttl: Duration,
    activity: ActivityTracker,
}

impl HistoryLedger {
    /// Create a ledger whose lists expire `data_ttl` after the last append.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, data_ttl: Duration, activity: ActivityTracker) -> Self {
        Self {
            kv,
            data_ttl,
            activity,
        }
    }

    /// Append a turn and refresh the session's idle timer.
    ///
    /// The append and the refresh are separate atomic steps. Returns the new
    /// number of turns.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    pub async fn append_turn(&self, user: &UserId, turn: &ConversationTurn) -> MemoryResult<u64> {
        let len = self.push(user, turn).await?;
        self.activity.start_or_refresh(user, Utc::now()).await?;
        Ok(len)
    }

    /// Append an assistant-initiated turn without refreshing the idle timer.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    pub async fn append_proactive_turn(
        &self,
        user: &UserId,
        turn: &ConversationTurn,
    ) -> MemoryResult<u64> {
        self.push(user, turn).await
    }

    async fn push(&self, user: &UserId, turn: &ConversationTurn) -> MemoryResult<u64> {
        let raw = turn.encode()?;
        let len = self
            .kv
            .push_back(&keys::history(user), &raw, Some(self.data_ttl))
            .await?;
        debug!(user = %user, len, "turn appended");
        Ok(len)
    }

    /// The last `k` turns, oldest first.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable or a turn is malformed.
    pub async fn read_tail(&self, user: &UserId, k: usize) -> MemoryResult<Vec<ConversationTurn>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let k = i64::try_from(k).unwrap_or(i64::MAX);
        self.read_range(user, -k, -1).await
    }

    /// Every stored turn, oldest first.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable or a turn is malformed.
    pub async fn read_all(&self, user: &UserId) -> MemoryResult<Vec<ConversationTurn>> {
        self.read_range(user, 0, -1).await
    }

    /// Turns in the inclusive index range `[start, stop]` (list semantics).
    ///
    /// # Errors
    /// Returns an error if the store is unreachable or a turn is malformed.
    pub async fn read_range(
        &self,
        user: &UserId,
        start: i64,
        stop: i64,
    ) -> MemoryResult<Vec<ConversationTurn>> {
        let key = keys::history(user);
        self.kv
            .list_range(&key, start, stop)
            .await?
            .iter()
            .map(|raw| ConversationTurn::decode(&key, raw))
            .collect()
    }

    /// Number of stored turns.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    pub async fn len(&self, user: &UserId) -> MemoryResult<u64> {
        self.kv.list_len(&keys::history(user)).await
    }
}
