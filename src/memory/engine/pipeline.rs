//! Inbound message pipeline.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::memory::adapters::rig_adapter::{
    ReplyGenerator, ReplyRequest, SafetyClassifier, SafetyVerdict,
};
use crate::memory::core::config::{MemoryConfig, PromptConfig};
use crate::memory::core::errors::MemoryResult;
use crate::memory::core::ids::{AudioId, RequestId, UserId};
use crate::memory::embedding::embedder::Embedder;
use crate::memory::engine::SessionBackends;
use crate::memory::engine::lifecycle::SessionLifecycle;
use crate::memory::ingest::audio::{AudioOutcome, AudioReassembler};
use crate::memory::ingest::dedupe::RequestDeduplicator;
use crate::memory::ingest::turn::ConversationTurn;
use crate::memory::prompt::prompt_budget::{PromptParts, enforce_budget};
use crate::memory::prompt::prompt_builder::build_prompt_block;
use crate::memory::summarization::cursor::FoldOutcome;
use crate::memory::summarization::llm_summarizer::Summarizer;

/// One inbound message from the transport.
#[derive(Clone, Debug)]
pub struct IncomingMessage {
    /// Sender.
    pub user: UserId,
    /// Transcript or typed text.
    pub text: String,
    /// Clip the fragment belongs to; derived from the text when absent.
    pub audio_id: Option<AudioId>,
    /// Whether this is the last fragment of the clip.
    pub is_final: bool,
    /// Transport request id; derived from the text when absent.
    pub request_id: Option<RequestId>,
}

impl IncomingMessage {
    /// A complete typed message.
    #[must_use]
    pub fn text(user: UserId, text: impl Into<String>) -> Self {
        Self {
            user,
            text: text.into(),
            audio_id: None,
            is_final: true,
            request_id: None,
        }
    }
}

/// What the pipeline answered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageOutcome {
    /// A partial fragment was acknowledged.
    Fragment {
        /// Whether the fragment entered the buffer.
        buffered: bool,
        /// Acknowledgement text.
        ack: String,
    },
    /// A final fragment was answered.
    Final(AudioOutcome),
}

impl MessageOutcome {
    /// Text to send back.
    #[must_use]
    pub fn reply(&self) -> &str {
        match self {
            Self::Fragment { ack, .. } => ack,
            Self::Final(outcome) => outcome.reply(),
        }
    }
}

/// End-to-end handling of inbound messages.
#[derive(Clone)]
pub struct ChatPipeline {
    lifecycle: SessionLifecycle,
    audio: AudioReassembler,
    dedupe: RequestDeduplicator,
    embedder: Arc<dyn Embedder>,
    summarizer: Arc<dyn Summarizer>,
    reply: Arc<dyn ReplyGenerator>,
    safety: Arc<dyn SafetyClassifier>,
    prompt: PromptConfig,
    chunk_rounds: usize,
    fragment_ack: String,
}

impl ChatPipeline {
    /// Wire the pipeline from shared backends.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the embedder and
    /// index dimensions disagree.
    pub fn new(config: &MemoryConfig, backends: &SessionBackends) -> MemoryResult<Self> {
        config.validate()?;
        backends.check_dimensions()?;
        Ok(Self {
            lifecycle: SessionLifecycle::new(config, backends),
            audio: AudioReassembler::new(backends.kv.clone(), config.audio.clone()),
            dedupe: RequestDeduplicator::new(
                backends.kv.clone(),
                std::time::Duration::from_secs(config.dedupe.ttl_seconds),
                config.dedupe.bucket_ms,
            ),
            embedder: backends.embedder.clone(),
            summarizer: backends.summarizer.clone(),
            reply: backends.reply.clone(),
            safety: backends.safety.clone(),
            prompt: config.prompt.clone(),
            chunk_rounds: config.summary.chunk_rounds,
            fragment_ack: config.audio.fragment_ack.clone(),
        })
    }

    /// Session lifecycle shared with the idle sweeper.
    #[must_use]
    pub const fn lifecycle(&self) -> &SessionLifecycle {
        &self.lifecycle
    }

    /// Audio reassembly.
    #[must_use]
    pub const fn audio(&self) -> &AudioReassembler {
        &self.audio
    }

    /// Request deduplication.
    #[must_use]
    pub const fn dedupe(&self) -> &RequestDeduplicator {
        &self.dedupe
    }

    /// Handle one inbound message.
    ///
    /// # Errors
    /// Returns store errors and reply generation failures. Safety, retrieval
    /// and summarization failures are logged and do not fail the message.
    pub async fn handle_message(&self, message: IncomingMessage) -> MemoryResult<MessageOutcome> {
        let IncomingMessage {
            user,
            text,
            audio_id,
            is_final,
            request_id,
        } = message;
        let audio = audio_id.unwrap_or_else(|| AudioId::from_text(&text));

        if !is_final {
            let buffered = self.audio.append_fragment(&user, &audio, &text).await?;
            return Ok(MessageOutcome::Fragment {
                buffered,
                ack: self.fragment_ack.clone(),
            });
        }

        let outcome = self
            .audio
            .process_final(&user, &audio, &text, |merged| {
                self.respond(&user, merged, request_id)
            })
            .await?;
        Ok(MessageOutcome::Final(outcome))
    }

    /// Record an assistant-initiated message without refreshing the idle timer.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    pub async fn record_proactive(&self, user: &UserId, text: &str) -> MemoryResult<u64> {
        self.lifecycle
            .ledger()
            .append_proactive_turn(user, &ConversationTurn::proactive(text))
            .await
    }

    async fn respond(
        &self,
        user: &UserId,
        text: String,
        request_id: Option<RequestId>,
    ) -> MemoryResult<String> {
        let verdict = match self.safety.classify(&text).await {
            Ok(verdict) => verdict,
            Err(err) => {
                warn!(user = %user, ?err, "safety check failed, treating as allowed");
                SafetyVerdict::allow()
            }
        };

        let request = if verdict.blocked {
            info!(user = %user, reason = %verdict.reason, "message blocked by safety check");
            ReplyRequest {
                context: String::new(),
                user_message: text.clone(),
                block_reason: Some(verdict.reason),
            }
        } else {
            ReplyRequest {
                context: self.build_context(user, &text).await?,
                user_message: text.clone(),
                block_reason: None,
            }
        };

        let reply = self.reply.generate(&request).await?;
        self.record_turn(user, &text, &reply, request_id).await?;
        Ok(reply)
    }

    /// Assemble the prompt block for a message.
    ///
    /// # Errors
    /// Returns an error if the summary or history cannot be read.
    pub async fn build_context(&self, user: &UserId, text: &str) -> MemoryResult<String> {
        let memory_pack = self.memory_pack(user, text).await;
        let (summary, _) = self.lifecycle.cursor().summary(user).await?;
        let tail = self
            .lifecycle
            .cursor()
            .unfolded_tail(user, self.prompt.tail_rounds)
            .await?;

        let parts = PromptParts::new(&self.prompt, memory_pack, &summary, tail, text.to_string());
        let parts = enforce_budget(parts, self.prompt.max_chars);
        Ok(build_prompt_block(&parts))
    }

    async fn memory_pack(&self, user: &UserId, text: &str) -> String {
        self.retrieve_memories(user, text).await.unwrap_or_else(|err| {
            warn!(user = %user, ?err, "memory retrieval failed");
            String::new()
        })
    }

    async fn retrieve_memories(&self, user: &UserId, text: &str) -> MemoryResult<String> {
        let query = self.embedder.embed(text).await?;
        self.lifecycle.memory().retrieve_default(user, query).await
    }

    async fn record_turn(
        &self,
        user: &UserId,
        text: &str,
        reply: &str,
        request_id: Option<RequestId>,
    ) -> MemoryResult<()> {
        let now_ms = Utc::now().timestamp_millis();
        let request = self.dedupe.request_id_for(user, text, request_id, now_ms);
        if !self.dedupe.try_register(user, &request).await? {
            return Ok(());
        }

        self.lifecycle
            .ledger()
            .append_turn(user, &ConversationTurn::new(text, reply, Some(request)))
            .await?;

        match self
            .lifecycle
            .cursor()
            .fold_next(user, self.chunk_rounds, self.summarizer.as_ref())
            .await
        {
            Ok(FoldOutcome::Folded { cursor }) => debug!(user = %user, cursor, "rolling fold"),
            Ok(_) => {}
            Err(err) => warn!(user = %user, ?err, "rolling fold failed"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::adapters::rig_adapter::AllowAllClassifier;
    use crate::memory::core::atom::AtomCandidate;
    use crate::memory::ingest::activity::SessionState;
    use crate::memory::kv::InMemoryKvStore;
    use crate::memory::storage::vector_index::InMemoryVectorIndex;
    use crate::memory::testing::{
        EchoReply, FixedExtractor, KeywordEmbedder, RecordingSummarizer, WordBlocker,
    };

    struct Fixture {
        pipeline: ChatPipeline,
        reply: Arc<EchoReply>,
        summarizer: Arc<RecordingSummarizer>,
    }

    fn fixture(safety: Arc<dyn SafetyClassifier>) -> Fixture {
        let reply = Arc::new(EchoReply::default());
        let summarizer = Arc::new(RecordingSummarizer::default());
        let backends = SessionBackends {
            kv: Arc::new(InMemoryKvStore::new()),
            index: Arc::new(InMemoryVectorIndex::new(KeywordEmbedder::DIMS)),
            embedder: Arc::new(KeywordEmbedder),
            summarizer: summarizer.clone(),
            extractor: Arc::new(FixedExtractor::default()),
            reply: reply.clone(),
            safety,
        };
        let mut config = MemoryConfig::default();
        config.embedding.ndims = KeywordEmbedder::DIMS;
        Fixture {
            pipeline: ChatPipeline::new(&config, &backends).unwrap(),
            reply,
            summarizer,
        }
    }

    fn user() -> UserId {
        UserId::new("u1").unwrap()
    }

    fn message(text: &str, rid: &str) -> IncomingMessage {
        IncomingMessage {
            request_id: Some(RequestId::new(rid).unwrap()),
            ..IncomingMessage::text(user(), text)
        }
    }

    #[tokio::test]
    async fn test_five_rounds_fold_then_not_enough() {
        let fx = fixture(Arc::new(AllowAllClassifier));
        let cursor = fx.pipeline.lifecycle().cursor();

        for i in 0..4 {
            fx.pipeline.handle_message(message(&format!("m{i}"), &format!("r{i}"))).await.unwrap();
        }
        assert_eq!(cursor.position(&user()).await.unwrap(), 0);
        assert_eq!(fx.summarizer.calls(), 0);

        fx.pipeline.handle_message(message("m4", "r4")).await.unwrap();
        assert_eq!(cursor.position(&user()).await.unwrap(), 5);
        let (summary, _) = cursor.summary(&user()).await.unwrap();
        assert_eq!(summary, "talked about m0, m1, m2, m3, m4");

        fx.pipeline.handle_message(message("m5", "r5")).await.unwrap();
        assert!(cursor.peek_next(&user(), 5).await.unwrap().is_none());
        assert_eq!(cursor.position(&user()).await.unwrap(), 5);
        assert_eq!(fx.summarizer.calls(), 1);
    }

    #[tokio::test]
    async fn test_reply_is_recorded_and_session_started() {
        let fx = fixture(Arc::new(AllowAllClassifier));
        let outcome = fx.pipeline.handle_message(message("hello there", "r1")).await.unwrap();

        assert_eq!(outcome.reply(), "echo: hello there");
        let history = fx.pipeline.lifecycle().ledger().read_all(&user()).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].output, "echo: hello there");
        assert_eq!(
            fx.pipeline.lifecycle().state(&user()).await.unwrap(),
            SessionState::Active
        );
        assert!(fx.pipeline.lifecycle().is_active(&user()).await.unwrap());
    }

    #[tokio::test]
    async fn test_redelivered_final_returns_cached_reply() {
        let fx = fixture(Arc::new(AllowAllClassifier));
        let first = IncomingMessage {
            audio_id: Some(AudioId::new("clip-9").unwrap()),
            ..message("how are you", "r1")
        };

        fx.pipeline.handle_message(first.clone()).await.unwrap();
        let again = fx.pipeline.handle_message(first).await.unwrap();

        assert_eq!(
            again,
            MessageOutcome::Final(AudioOutcome::Cached("echo: how are you".to_string()))
        );
        let history = fx.pipeline.lifecycle().ledger().read_all(&user()).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_request_is_not_appended_twice() {
        let fx = fixture(Arc::new(AllowAllClassifier));
        fx.pipeline.handle_message(message("same", "r1")).await.unwrap();
        let retry = IncomingMessage {
            audio_id: Some(AudioId::new("other-clip").unwrap()),
            ..message("same", "r1")
        };
        fx.pipeline.handle_message(retry).await.unwrap();

        let history = fx.pipeline.lifecycle().ledger().read_all(&user()).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_fragments_are_merged_before_reply() {
        let fx = fixture(Arc::new(AllowAllClassifier));
        let clip = AudioId::new("clip-1").unwrap();
        let partial = IncomingMessage {
            audio_id: Some(clip.clone()),
            is_final: false,
            ..message("my knee", "r1")
        };

        let ack = fx.pipeline.handle_message(partial).await.unwrap();
        assert!(matches!(ack, MessageOutcome::Fragment { buffered: true, .. }));

        let last = IncomingMessage {
            audio_id: Some(clip),
            ..message("hurts today", "r1")
        };
        let outcome = fx.pipeline.handle_message(last).await.unwrap();
        assert_eq!(outcome.reply(), "echo: my knee hurts today");
    }

    #[tokio::test]
    async fn test_blocked_message_skips_context() {
        let fx = fixture(Arc::new(WordBlocker { word: "dosage" }));
        let memory = fx.pipeline.lifecycle().memory();
        memory
            .remember(
                &user(),
                vec![AtomCandidate {
                    text: "takes dosage notes".to_string(),
                    ..AtomCandidate::default()
                }],
                &KeywordEmbedder,
                None,
                Utc::now(),
            )
            .await
            .unwrap();

        let outcome = fx.pipeline.handle_message(message("what dosage", "r1")).await.unwrap();

        let request = fx.reply.last_request().unwrap();
        assert!(request.is_blocked());
        assert!(request.context.is_empty());
        assert!(outcome.reply().contains("doctor"));
    }

    #[tokio::test]
    async fn test_context_includes_memory_summary_and_tail() {
        let fx = fixture(Arc::new(AllowAllClassifier));
        fx.pipeline
            .lifecycle()
            .memory()
            .remember(
                &user(),
                vec![AtomCandidate {
                    atom_type: Some("diet".to_string()),
                    norm_key: Some("dinner".to_string()),
                    text: "prefers light dinners".to_string(),
                    ..AtomCandidate::default()
                }],
                &KeywordEmbedder,
                None,
                Utc::now(),
            )
            .await
            .unwrap();
        fx.pipeline.handle_message(message("hello", "r1")).await.unwrap();

        let block = fx
            .pipeline
            .build_context(&user(), "prefers light dinners")
            .await
            .unwrap();
        assert!(block.contains("[MEMORY_RELEVANT]\n- prefers light dinners\n"));
        assert!(block.contains("- User: hello"));
        assert!(block.ends_with("[USER_MESSAGE]\nprefers light dinners\n"));
    }

    #[tokio::test]
    async fn test_proactive_turn_does_not_start_session() {
        let fx = fixture(Arc::new(AllowAllClassifier));
        fx.pipeline.record_proactive(&user(), "time for your walk").await.unwrap();

        assert_eq!(
            fx.pipeline.lifecycle().state(&user()).await.unwrap(),
            SessionState::Absent
        );
        assert!(!fx.pipeline.lifecycle().is_active(&user()).await.unwrap());
    }
}
