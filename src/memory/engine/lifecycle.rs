//! Session lifecycle: `Absent -> Active -> Finalizing -> Absent`.
//!
//! Every transition is a compare-and-set on the state key, so exactly one
//! worker wins the right to finalize an idle session. Finalization flushes the
//! unfolded rounds, re-summarizes the whole history, stores the extracted
//! long-term memories and then purges every per-user key, whether or not the
//! earlier steps succeeded.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::memory::core::config::MemoryConfig;
use crate::memory::core::errors::MemoryResult;
use crate::memory::core::ids::{SessionId, UserId};
use crate::memory::embedding::embedder::Embedder;
use crate::memory::engine::SessionBackends;
use crate::memory::ingest::activity::{ActivityTracker, SessionState, parse_unix_seconds};
use crate::memory::ingest::extractor_llm::MemoryExtractor;
use crate::memory::ingest::ledger::HistoryLedger;
use crate::memory::kv::keys;
use crate::memory::kv::store::{KvStore, KvWrite, PlanFault};
use crate::memory::storage::memory_store::LongTermMemory;
use crate::memory::summarization::cursor::{FoldOutcome, SummaryCursor};
use crate::memory::summarization::llm_summarizer::Summarizer;

/// What one finalization did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FinalizeReport {
    /// Result of flushing the unfolded rounds.
    pub flush: Option<FoldOutcome>,
    /// Length of the refined summary in characters.
    pub refined_chars: usize,
    /// Memory atoms written to the index.
    pub atoms_stored: usize,
    /// Keys removed by the purge.
    pub purged_keys: u64,
    /// Failure of the consolidation steps, if any. The purge ran regardless.
    pub error: Option<String>,
}

/// Result of a finalize request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// The session was not `Active` or another worker claimed it first.
    NotClaimed,
    /// This worker finalized the session.
    Finalized(FinalizeReport),
}

/// Drives session state transitions and finalization.
#[derive(Clone)]
pub struct SessionLifecycle {
    kv: Arc<dyn KvStore>,
    activity: ActivityTracker,
    ledger: HistoryLedger,
    cursor: SummaryCursor,
    memory: LongTermMemory,
    embedder: Arc<dyn Embedder>,
    summarizer: Arc<dyn Summarizer>,
    extractor: Arc<dyn MemoryExtractor>,
    refine_chunk_rounds: usize,
}

impl SessionLifecycle {
    /// Wire the lifecycle from shared backends.
    #[must_use]
    pub fn new(config: &MemoryConfig, backends: &SessionBackends) -> Self {
        let activity = ActivityTracker::new(backends.kv.clone(), config.session.idle_timeout());
        let ledger = HistoryLedger::new(
            backends.kv.clone(),
            config.session.data_ttl(),
            activity.clone(),
        );
        let cursor = SummaryCursor::new(backends.kv.clone(), ledger.clone());
        let memory = LongTermMemory::new(
            backends.index.clone(),
            config.retrieval.clone(),
            config.scoring.clone(),
        );
        Self {
            kv: backends.kv.clone(),
            activity,
            ledger,
            cursor,
            memory,
            embedder: backends.embedder.clone(),
            summarizer: backends.summarizer.clone(),
            extractor: backends.extractor.clone(),
            refine_chunk_rounds: config.summary.refine_chunk_rounds.max(1),
        }
    }

    /// Activity markers.
    #[must_use]
    pub const fn activity(&self) -> &ActivityTracker {
        &self.activity
    }

    /// History ledger.
    #[must_use]
    pub const fn ledger(&self) -> &HistoryLedger {
        &self.ledger
    }

    /// Summary cursor.
    #[must_use]
    pub const fn cursor(&self) -> &SummaryCursor {
        &self.cursor
    }

    /// Long-term memory store.
    #[must_use]
    pub const fn memory(&self) -> &LongTermMemory {
        &self.memory
    }

    /// Current lifecycle state.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable or the value is malformed.
    pub async fn state(&self, user: &UserId) -> MemoryResult<SessionState> {
        let key = keys::session_state(user);
        let raw = self.kv.get(&key).await?;
        SessionState::from_stored(&key, raw.as_deref())
    }

    /// Whether the idle marker is alive.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    pub async fn is_active(&self, user: &UserId) -> MemoryResult<bool> {
        self.activity.is_active(user).await
    }

    /// Move from `expect` to `to` if the live state equals `expect`.
    ///
    /// Moving to [`SessionState::Absent`] deletes the key. Returns `false`
    /// without writing on mismatch or concurrent change.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable or the stored state is
    /// malformed.
    pub async fn set_state_if(
        &self,
        user: &UserId,
        expect: SessionState,
        to: SessionState,
    ) -> MemoryResult<bool> {
        let key = keys::session_state(user);
        let plan_key = key.clone();
        let fault = PlanFault::default();
        let plan_fault = fault.clone();
        let swapped = self
            .kv
            .watch_and_commit(
                vec![key],
                Box::new(move |current: &[Option<String>]| {
                    let live = match SessionState::from_stored(
                        &plan_key,
                        current.first().and_then(Option::as_deref),
                    ) {
                        Ok(live) => live,
                        Err(err) => {
                            plan_fault.record(err);
                            return None;
                        }
                    };
                    if live != expect {
                        return None;
                    }
                    Some(vec![match to.as_stored() {
                        Some(value) => KvWrite::set(plan_key, value),
                        None => KvWrite::delete(plan_key),
                    }])
                }),
            )
            .await?;
        fault.check()?;
        debug!(user = %user, ?expect, ?to, swapped, "session state transition");
        Ok(swapped)
    }

    /// Finalize a session if this worker wins `Active -> Finalizing`.
    ///
    /// # Errors
    /// Returns an error if the claim or the purge cannot reach the store.
    /// Failures of the consolidation steps are reported, not returned.
    pub async fn finalize(&self, user: &UserId) -> MemoryResult<FinalizeOutcome> {
        if !self
            .set_state_if(user, SessionState::Active, SessionState::Finalizing)
            .await?
        {
            return Ok(FinalizeOutcome::NotClaimed);
        }
        info!(user = %user, "finalizing session");

        let mut report = FinalizeReport::default();
        if let Err(err) = self.consolidate(user, &mut report).await {
            warn!(user = %user, ?err, "session consolidation failed, purging anyway");
            report.error = Some(err.to_string());
        }
        report.purged_keys = self.purge(user).await?;

        info!(
            user = %user,
            atoms = report.atoms_stored,
            purged = report.purged_keys,
            "session finalized"
        );
        Ok(FinalizeOutcome::Finalized(report))
    }

    async fn consolidate(&self, user: &UserId, report: &mut FinalizeReport) -> MemoryResult<()> {
        report.flush = Some(
            self.cursor
                .fold_remaining(user, self.summarizer.as_ref())
                .await?,
        );

        let refined = self.refine(user).await?;
        report.refined_chars = refined.chars().count();
        if refined.trim().is_empty() {
            return Ok(());
        }

        let candidates = match self.extractor.extract(&refined).await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(user = %user, ?err, "memory extraction failed");
                Vec::new()
            }
        };
        report.atoms_stored = self
            .memory
            .remember(
                user,
                candidates,
                self.embedder.as_ref(),
                Some(SessionId::new()),
                Utc::now(),
            )
            .await?;
        Ok(())
    }

    /// Map-reduce summary of the full history; falls back to the running
    /// summary when the summarizer fails.
    async fn refine(&self, user: &UserId) -> MemoryResult<String> {
        let (running, _) = self.cursor.summary(user).await?;
        let history = self.ledger.read_all(user).await?;
        if history.is_empty() {
            return Ok(running);
        }

        let mut parts = Vec::new();
        for chunk in history.chunks(self.refine_chunk_rounds) {
            match self.summarizer.summarize(chunk).await {
                Ok(part) if !part.trim().is_empty() => parts.push(part),
                Ok(_) => {}
                Err(err) => {
                    warn!(user = %user, ?err, "chunk summary failed, using running summary");
                    return Ok(running);
                }
            }
        }

        match self.summarizer.combine(&parts).await {
            Ok(refined) => Ok(refined),
            Err(err) => {
                warn!(user = %user, ?err, "summary combine failed, using running summary");
                Ok(running)
            }
        }
    }

    /// Delete every key the user owns. Returns how many existed.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    pub async fn purge(&self, user: &UserId) -> MemoryResult<u64> {
        let mut doomed = keys::session_keys(user);
        for prefix in keys::scan_prefixes(user) {
            doomed.extend(self.kv.scan_keys(&prefix).await?);
        }
        let removed = self.kv.delete(doomed).await?;
        debug!(user = %user, removed, "session keys purged");
        Ok(removed)
    }

    /// Users whose last activity is at least `timeout` old and whose idle
    /// marker has lapsed.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    pub async fn expired_sessions(
        &self,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> MemoryResult<Vec<UserId>> {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        let mut expired = Vec::new();
        for key in self.kv.scan_keys(keys::LAST_ACTIVE_PREFIX).await? {
            let Some(user) = keys::user_from_last_active(&key) else {
                warn!(key = %key, "unparseable last-activity key skipped");
                continue;
            };
            let Some(raw) = self.kv.get(&key).await? else {
                continue;
            };
            let last = match parse_unix_seconds(&key, &raw) {
                Ok(last) => last,
                Err(err) => {
                    warn!(user = %user, ?err, "malformed last-activity value skipped");
                    continue;
                }
            };
            if now.signed_duration_since(last) >= timeout && !self.is_active(&user).await? {
                expired.push(user);
            }
        }
        Ok(expired)
    }

    /// Hand a session stuck in `Finalizing` back to `Active` so it can be
    /// finalized again.
    ///
    /// Only applies when the last activity is at least `stale_after` old,
    /// which covers a worker that died between the claim and the purge.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable or a value is malformed.
    pub async fn reclaim_stale(
        &self,
        user: &UserId,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> MemoryResult<bool> {
        if self.state(user).await? != SessionState::Finalizing {
            return Ok(false);
        }
        let Some(last) = self.activity.last_active(user).await? else {
            return Ok(false);
        };
        let stale_after = chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX);
        if now.signed_duration_since(last) < stale_after {
            return Ok(false);
        }

        let reclaimed = self
            .set_state_if(user, SessionState::Finalizing, SessionState::Active)
            .await?;
        if reclaimed {
            warn!(user = %user, %last, "reclaimed session stuck in finalizing");
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::adapters::rig_adapter::AllowAllClassifier;
    use crate::memory::core::atom::AtomCandidate;
    use crate::memory::core::errors::MemoryError;
    use crate::memory::core::ids::{AudioId, RequestId};
    use crate::memory::ingest::audio::AudioReassembler;
    use crate::memory::ingest::dedupe::RequestDeduplicator;
    use crate::memory::ingest::turn::ConversationTurn;
    use crate::memory::kv::InMemoryKvStore;
    use crate::memory::storage::vector_index::{InMemoryVectorIndex, VectorIndex};
    use crate::memory::testing::{
        EchoReply, FixedExtractor, KeywordEmbedder, RecordingSummarizer,
    };

    struct Fixture {
        kv: Arc<InMemoryKvStore>,
        index: Arc<InMemoryVectorIndex>,
        lifecycle: SessionLifecycle,
        config: MemoryConfig,
    }

    fn fixture(summarizer: RecordingSummarizer, extractor: FixedExtractor) -> Fixture {
        let kv = Arc::new(InMemoryKvStore::new());
        let index = Arc::new(InMemoryVectorIndex::new(KeywordEmbedder::DIMS));
        let backends = SessionBackends {
            kv: kv.clone(),
            index: index.clone(),
            embedder: Arc::new(KeywordEmbedder),
            summarizer: Arc::new(summarizer),
            extractor: Arc::new(extractor),
            reply: Arc::new(EchoReply::default()),
            safety: Arc::new(AllowAllClassifier),
        };
        let config = MemoryConfig::default();
        let lifecycle = SessionLifecycle::new(&config, &backends);
        Fixture {
            kv,
            index,
            lifecycle,
            config,
        }
    }

    fn user() -> UserId {
        UserId::new("u1").unwrap()
    }

    fn diet_fact() -> AtomCandidate {
        AtomCandidate {
            atom_type: Some("diet".to_string()),
            norm_key: Some("diet:light".to_string()),
            text: "prefers light dinners".to_string(),
            importance: Some(4),
            confidence: Some(0.9),
            times_seen: None,
        }
    }

    async fn seed(fx: &Fixture, rounds: usize) {
        for i in 0..rounds {
            fx.lifecycle
                .ledger()
                .append_turn(&user(), &ConversationTurn::new(format!("q{i}"), format!("a{i}"), None))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_set_state_if_guards_transitions() {
        let fx = fixture(RecordingSummarizer::default(), FixedExtractor::default());
        let lc = &fx.lifecycle;

        assert!(!lc.set_state_if(&user(), SessionState::Active, SessionState::Finalizing).await.unwrap());
        assert!(lc.set_state_if(&user(), SessionState::Absent, SessionState::Active).await.unwrap());
        assert!(!lc.set_state_if(&user(), SessionState::Absent, SessionState::Active).await.unwrap());
        assert_eq!(lc.state(&user()).await.unwrap(), SessionState::Active);

        assert!(lc.set_state_if(&user(), SessionState::Active, SessionState::Absent).await.unwrap());
        assert_eq!(lc.state(&user()).await.unwrap(), SessionState::Absent);
    }

    #[tokio::test]
    async fn test_set_state_if_reports_corrupt_state() {
        let fx = fixture(RecordingSummarizer::default(), FixedExtractor::default());
        fx.kv
            .set(&keys::session_state(&user()), "zombie", None)
            .await
            .unwrap();

        assert!(matches!(
            fx.lifecycle
                .set_state_if(&user(), SessionState::Active, SessionState::Finalizing)
                .await,
            Err(MemoryError::CorruptValue { .. })
        ));
        assert_eq!(
            fx.kv.get(&keys::session_state(&user())).await.unwrap().as_deref(),
            Some("zombie")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_finalize_claims_once() {
        let fx = fixture(RecordingSummarizer::default(), FixedExtractor::default());
        seed(&fx, 1).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lc = fx.lifecycle.clone();
            handles.push(tokio::spawn(async move {
                lc.set_state_if(&user(), SessionState::Active, SessionState::Finalizing)
                    .await
                    .unwrap()
            }));
        }
        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        assert!(!fx.lifecycle
            .set_state_if(&user(), SessionState::Active, SessionState::Finalizing)
            .await
            .unwrap());
        assert_eq!(fx.lifecycle.state(&user()).await.unwrap(), SessionState::Finalizing);
    }

    #[tokio::test]
    async fn test_finalize_stores_memories_and_purges_everything() {
        let fx = fixture(RecordingSummarizer::default(), FixedExtractor::new(vec![diet_fact()]));
        let u = user();
        seed(&fx, 7).await;
        fx.lifecycle
            .cursor()
            .fold_next(&u, 5, &RecordingSummarizer::default())
            .await
            .unwrap();

        let audio = AudioReassembler::new(fx.kv.clone(), fx.config.audio.clone());
        let clip = AudioId::new("clip-1").unwrap();
        audio.append_fragment(&u, &clip, "partial").await.unwrap();
        audio
            .store_result(&u, &AudioId::new("clip-0").unwrap(), "done", Duration::from_secs(60))
            .await
            .unwrap();
        audio.acquire_lock(&u, &clip, Duration::from_secs(60)).await.unwrap();
        let dedupe = RequestDeduplicator::new(fx.kv.clone(), Duration::from_secs(60), 3000);
        dedupe.try_register(&u, &RequestId::new("r1").unwrap()).await.unwrap();

        let outcome = fx.lifecycle.finalize(&u).await.unwrap();
        let FinalizeOutcome::Finalized(report) = outcome else {
            panic!("expected finalization, got {outcome:?}");
        };
        assert_eq!(report.flush, Some(FoldOutcome::Folded { cursor: 7 }));
        assert_eq!(report.atoms_stored, 1);
        assert!(report.error.is_none());

        assert!(fx.kv.is_empty().await);
        assert_eq!(fx.lifecycle.state(&u).await.unwrap(), SessionState::Absent);
        let stored = fx.index.query_user(&u, None).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].source_session_id.is_some());
    }

    #[tokio::test]
    async fn test_finalize_purges_when_extraction_fails() {
        let fx = fixture(RecordingSummarizer::default(), FixedExtractor::failing());
        seed(&fx, 3).await;

        let FinalizeOutcome::Finalized(report) = fx.lifecycle.finalize(&user()).await.unwrap() else {
            panic!("expected finalization");
        };
        assert_eq!(report.atoms_stored, 0);
        assert!(fx.kv.is_empty().await);
        assert!(fx.index.is_empty());
    }

    #[tokio::test]
    async fn test_finalize_purges_when_summarizer_fails() {
        let fx = fixture(RecordingSummarizer::failing(), FixedExtractor::new(vec![diet_fact()]));
        seed(&fx, 3).await;

        let FinalizeOutcome::Finalized(report) = fx.lifecycle.finalize(&user()).await.unwrap() else {
            panic!("expected finalization");
        };
        assert_eq!(report.flush, Some(FoldOutcome::SummarizeFailed));
        assert_eq!(report.refined_chars, 0);
        assert!(fx.kv.is_empty().await);
    }

    #[tokio::test]
    async fn test_finalize_refines_full_history_in_chunks() {
        let extractor = Arc::new(FixedExtractor::default());
        let kv = Arc::new(InMemoryKvStore::new());
        let mut config = MemoryConfig::default();
        config.summary.refine_chunk_rounds = 2;
        let backends = SessionBackends {
            kv: kv.clone(),
            index: Arc::new(InMemoryVectorIndex::new(KeywordEmbedder::DIMS)),
            embedder: Arc::new(KeywordEmbedder),
            summarizer: Arc::new(RecordingSummarizer::default()),
            extractor: extractor.clone(),
            reply: Arc::new(EchoReply::default()),
            safety: Arc::new(AllowAllClassifier),
        };
        let lifecycle = SessionLifecycle::new(&config, &backends);
        for i in 0..3 {
            lifecycle
                .ledger()
                .append_turn(&user(), &ConversationTurn::new(format!("q{i}"), "a", None))
                .await
                .unwrap();
        }

        lifecycle.finalize(&user()).await.unwrap();

        let seen = extractor.seen.lock().unwrap().clone();
        assert_eq!(seen, vec!["talked about q0, q1 | talked about q2".to_string()]);
    }

    #[tokio::test]
    async fn test_finalize_requires_active_session() {
        let fx = fixture(RecordingSummarizer::default(), FixedExtractor::default());
        assert_eq!(
            fx.lifecycle.finalize(&user()).await.unwrap(),
            FinalizeOutcome::NotClaimed
        );
    }

    #[tokio::test]
    async fn test_reclaim_stale_finalizing() {
        let fx = fixture(RecordingSummarizer::default(), FixedExtractor::default());
        let start = Utc::now();
        fx.lifecycle.activity().start_or_refresh(&user(), start).await.unwrap();
        let grace = Duration::from_secs(600);

        assert!(!fx.lifecycle.reclaim_stale(&user(), start, grace).await.unwrap());

        assert!(fx
            .lifecycle
            .set_state_if(&user(), SessionState::Active, SessionState::Finalizing)
            .await
            .unwrap());
        let soon = start + chrono::Duration::seconds(60);
        assert!(!fx.lifecycle.reclaim_stale(&user(), soon, grace).await.unwrap());
        assert_eq!(fx.lifecycle.state(&user()).await.unwrap(), SessionState::Finalizing);

        let late = start + chrono::Duration::seconds(601);
        assert!(fx.lifecycle.reclaim_stale(&user(), late, grace).await.unwrap());
        assert_eq!(fx.lifecycle.state(&user()).await.unwrap(), SessionState::Active);
        assert!(matches!(
            fx.lifecycle.finalize(&user()).await.unwrap(),
            FinalizeOutcome::Finalized(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_sessions_after_idle_timeout() {
        let fx = fixture(RecordingSummarizer::default(), FixedExtractor::default());
        let idle = fx.config.session.idle_timeout();
        let start = Utc::now();
        fx.lifecycle.activity().start_or_refresh(&user(), start).await.unwrap();
        let other = UserId::new("u2").unwrap();

        assert!(fx.lifecycle.expired_sessions(start, idle).await.unwrap().is_empty());

        tokio::time::advance(idle + Duration::from_secs(1)).await;
        let later = start + chrono::Duration::seconds(i64::try_from(idle.as_secs()).unwrap() + 1);
        fx.lifecycle.activity().start_or_refresh(&other, later).await.unwrap();

        let expired = fx.lifecycle.expired_sessions(later, idle).await.unwrap();
        assert_eq!(expired, vec![user()]);
    }
}
