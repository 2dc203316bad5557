//! Session orchestration: lifecycle state machine and message pipeline.

pub mod lifecycle;
pub mod pipeline;

use std::sync::Arc;

pub use lifecycle::{FinalizeOutcome, FinalizeReport, SessionLifecycle};
pub use pipeline::{ChatPipeline, IncomingMessage, MessageOutcome};

use crate::memory::adapters::rig_adapter::{
    LlmSafetyClassifier, OllamaReplyGenerator, ReplyGenerator, SafetyClassifier,
};
use crate::memory::core::config::MemoryConfig;
use crate::memory::core::errors::{MemoryError, MemoryResult};
use crate::memory::embedding::embedder::{Embedder, OllamaEmbedder};
use crate::memory::ingest::extractor_llm::{LlmAtomExtractor, MemoryExtractor};
use crate::memory::kv::{KvStore, RedisKvStore};
use crate::memory::storage::sqlite_vector_index::SqliteVectorIndex;
use crate::memory::storage::vector_index::VectorIndex;
use crate::memory::summarization::llm_summarizer::{LlmSummarizer, Summarizer};

/// Stores and collaborators shared by every session component.
#[derive(Clone)]
pub struct SessionBackends {
    /// Per-user conversational state.
    pub kv: Arc<dyn KvStore>,
    /// Long-term memory atoms.
    pub index: Arc<dyn VectorIndex>,
    /// Embedding model wrapper.
    pub embedder: Arc<dyn Embedder>,
    /// Round summarizer.
    pub summarizer: Arc<dyn Summarizer>,
    /// Memory atom extractor.
    pub extractor: Arc<dyn MemoryExtractor>,
    /// Reply generator.
    pub reply: Arc<dyn ReplyGenerator>,
    /// Safety screen.
    pub safety: Arc<dyn SafetyClassifier>,
}

impl SessionBackends {
    /// Build Redis, `SQLite` and Ollama backends from config.
    ///
    /// # Errors
    /// Returns an error if any backend cannot be initialized or the embedder
    /// and index dimensions disagree.
    pub async fn from_config(config: &MemoryConfig) -> MemoryResult<Self> {
        let kv = Arc::new(RedisKvStore::new(&config.storage)?);
        let index = Arc::new(
            SqliteVectorIndex::open(
                &config.storage.sqlite_path,
                &config.storage.memory_table,
                config.embedding.ndims,
            )
            .await?,
        );
        let embedder = Arc::new(OllamaEmbedder::new(&config.embedding)?);
        let summarizer = Arc::new(LlmSummarizer::new(
            &config.llm,
            config.prompt.summary_max_chars,
        )?);
        let extractor = Arc::new(LlmAtomExtractor::new(&config.llm, &config.extractor)?);
        let reply = Arc::new(OllamaReplyGenerator::new(&config.llm)?);
        let safety = Arc::new(LlmSafetyClassifier::new(&config.llm)?);

        let backends = Self {
            kv,
            index,
            embedder,
            summarizer,
            extractor,
            reply,
            safety,
        };
        backends.check_dimensions()?;
        Ok(backends)
    }

    /// Verify that the embedder produces vectors the index accepts.
    ///
    /// # Errors
    /// Returns [`MemoryError::InvalidConfig`] on mismatch.
    pub fn check_dimensions(&self) -> MemoryResult<()> {
        let (embedder, index) = (self.embedder.ndims(), self.index.dims());
        if embedder != index {
            return Err(MemoryError::InvalidConfig(format!(
                "embedder produces {embedder} dimensions but the index stores {index}"
            )));
        }
        Ok(())
    }
}
