//! Rolling summary cursor.
//!
//! The cursor counts how many rounds of the history are already folded into
//! the running summary text. Both values move together in one optimistic
//! transaction guarded by the cursor value the caller read, so concurrent
//! workers folding the same window produce exactly one commit.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::memory::core::errors::{MemoryError, MemoryResult};
use crate::memory::core::ids::UserId;
use crate::memory::ingest::ledger::HistoryLedger;
use crate::memory::ingest::turn::ConversationTurn;
use crate::memory::kv::keys;
use crate::memory::kv::store::{KvStore, KvWrite, PlanFault};
use crate::memory::summarization::llm_summarizer::Summarizer;

/// Unfolded rounds starting at `cursor`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FoldWindow {
    /// Cursor value the window was read at.
    pub cursor: u64,
    /// Rounds `[cursor, cursor + rounds.len())`.
    pub rounds: Vec<ConversationTurn>,
}

/// Result of a fold attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FoldOutcome {
    /// Fewer unfolded rounds than requested.
    NotEnough,
    /// Committed; the cursor now has this value.
    Folded {
        /// New cursor value.
        cursor: u64,
    },
    /// Another writer moved the cursor first.
    RaceLost,
    /// The summarizer failed; nothing was committed.
    SummarizeFailed,
}

/// Append a chunk summary to the running text.
#[must_use]
pub fn append_summary(current: &str, addition: &str) -> String {
    let addition = addition.trim();
    if addition.is_empty() {
        return current.to_string();
    }
    if current.is_empty() {
        return addition.to_string();
    }
    format!("{current}\n\n{addition}")
}

fn parse_cursor(key: &str, raw: Option<&str>) -> MemoryResult<u64> {
    raw.map_or(Ok(0), |raw| {
        raw.trim()
            .parse::<u64>()
            .map_err(|err| MemoryError::corrupt(key, err))
    })
}

fn to_index(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Reads and advances the summary cursor of each user.
#[derive(Clone)]
pub struct SummaryCursor {
    kv: Arc<dyn KvStore>,
    ledger: HistoryLedger,
}

impl SummaryCursor {
    /// Create a cursor over the given ledger.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, ledger: HistoryLedger) -> Self {
        Self { kv, ledger }
    }

    /// Current cursor value.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable or the value is malformed.
    pub async fn position(&self, user: &UserId) -> MemoryResult<u64> {
        let key = keys::summary_rounds(user);
        let raw = self.kv.get(&key).await?;
        parse_cursor(&key, raw.as_deref())
    }

    /// Running summary text and cursor, read together.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable or the cursor is malformed.
    pub async fn summary(&self, user: &UserId) -> MemoryResult<(String, u64)> {
        let rounds_key = keys::summary_rounds(user);
        let values = self
            .kv
            .get_many(vec![keys::summary_text(user), rounds_key.clone()])
            .await?;
        let text = values.first().cloned().flatten().unwrap_or_default();
        let cursor = parse_cursor(&rounds_key, values.get(1).and_then(Option::as_deref))?;
        Ok((text, cursor))
    }

    /// The next `n` unfolded rounds, or `None` when fewer remain.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    pub async fn peek_next(&self, user: &UserId, n: usize) -> MemoryResult<Option<FoldWindow>> {
        if n == 0 {
            return Ok(None);
        }
        let cursor = self.position(user).await?;
        let len = self.ledger.len(user).await?;
        let n = n as u64;
        if len.saturating_sub(cursor) < n {
            return Ok(None);
        }
        let rounds = self
            .ledger
            .read_range(user, to_index(cursor), to_index(cursor + n - 1))
            .await?;
        Ok(Some(FoldWindow { cursor, rounds }))
    }

    /// Every unfolded round; possibly empty.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    pub async fn peek_remaining(&self, user: &UserId) -> MemoryResult<FoldWindow> {
        let cursor = self.position(user).await?;
        let rounds = self.ledger.read_range(user, to_index(cursor), -1).await?;
        Ok(FoldWindow { cursor, rounds })
    }

    /// The last `k` unfolded rounds, oldest first.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    pub async fn unfolded_tail(
        &self,
        user: &UserId,
        k: usize,
    ) -> MemoryResult<Vec<ConversationTurn>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let cursor = self.position(user).await?;
        let len = self.ledger.len(user).await?;
        let start = cursor.max(len.saturating_sub(k as u64));
        if start >= len {
            return Ok(Vec::new());
        }
        self.ledger.read_range(user, to_index(start), -1).await
    }

    /// Advance the cursor from `expected` by `advance` and append `text`.
    ///
    /// Returns `false`, writing nothing, when the advance would pass the end of
    /// the history, when the live cursor differs from `expected`, or when the
    /// cursor or text changed concurrently. Callers do not retry.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable or the stored cursor is
    /// malformed.
    pub async fn commit(
        &self,
        user: &UserId,
        expected: u64,
        advance: u64,
        text: &str,
    ) -> MemoryResult<bool> {
        let len = self.ledger.len(user).await?;
        let target = expected.saturating_add(advance);
        if target > len {
            warn!(user = %user, expected, advance, len, "fold past end of history rejected");
            return Ok(false);
        }

        let rounds_key = keys::summary_rounds(user);
        let text_key = keys::summary_text(user);
        let addition = text.to_string();
        let plan_rounds_key = rounds_key.clone();
        let plan_text_key = text_key.clone();
        let fault = PlanFault::default();
        let plan_fault = fault.clone();

        let committed = self
            .kv
            .watch_and_commit(
                vec![rounds_key, text_key],
                Box::new(move |current: &[Option<String>]| {
                    let live = match parse_cursor(
                        &plan_rounds_key,
                        current.first().and_then(Option::as_deref),
                    ) {
                        Ok(live) => live,
                        Err(err) => {
                            plan_fault.record(err);
                            return None;
                        }
                    };
                    if live != expected {
                        return None;
                    }
                    let old_text = current.get(1).and_then(Option::as_deref).unwrap_or("");
                    Some(vec![
                        KvWrite::set(plan_text_key, append_summary(old_text, &addition)),
                        KvWrite::set(plan_rounds_key, target.to_string()),
                    ])
                }),
            )
            .await?;
        fault.check()?;

        if committed {
            debug!(user = %user, from = expected, to = target, "summary cursor advanced");
        } else {
            debug!(user = %user, expected, "summary commit lost");
        }
        Ok(committed)
    }

    /// Fold the next `n` rounds: peek, summarize, commit.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    pub async fn fold_next(
        &self,
        user: &UserId,
        n: usize,
        summarizer: &dyn Summarizer,
    ) -> MemoryResult<FoldOutcome> {
        let Some(window) = self.peek_next(user, n).await? else {
            return Ok(FoldOutcome::NotEnough);
        };
        self.fold_window(user, window, summarizer).await
    }

    /// Fold every remaining round.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    pub async fn fold_remaining(
        &self,
        user: &UserId,
        summarizer: &dyn Summarizer,
    ) -> MemoryResult<FoldOutcome> {
        let window = self.peek_remaining(user).await?;
        if window.rounds.is_empty() {
            return Ok(FoldOutcome::NotEnough);
        }
        self.fold_window(user, window, summarizer).await
    }

    async fn fold_window(
        &self,
        user: &UserId,
        window: FoldWindow,
        summarizer: &dyn Summarizer,
    ) -> MemoryResult<FoldOutcome> {
        let text = match summarizer.summarize(&window.rounds).await {
            Ok(text) => text,
            Err(err) => {
                warn!(user = %user, cursor = window.cursor, ?err, "summarizer failed, fold skipped");
                return Ok(FoldOutcome::SummarizeFailed);
            }
        };

        let advance = window.rounds.len() as u64;
        if self.commit(user, window.cursor, advance, &text).await? {
            let cursor = window.cursor + advance;
            info!(user = %user, cursor, "rounds folded into summary");
            Ok(FoldOutcome::Folded { cursor })
        } else {
            Ok(FoldOutcome::RaceLost)
        }
    }
}
