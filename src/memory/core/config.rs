//! Configuration for the dialogue memory subsystem.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::memory::core::errors::{MemoryError, MemoryResult};

/// Top-level configuration for the memory engine.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Session activity and data retention settings.
    pub session: SessionConfig,
    /// Request idempotency settings.
    pub dedupe: DedupeConfig,
    /// Rolling and final summarization settings.
    pub summary: SummaryConfig,
    /// Streamed audio reassembly settings.
    pub audio: AudioConfig,
    /// Long-term memory retrieval settings.
    pub retrieval: RetrievalConfig,
    /// Ranking coefficients.
    pub scoring: ScoringConfig,
    /// Memory atom extraction settings.
    pub extractor: ExtractorConfig,
    /// Prompt construction settings.
    pub prompt: PromptConfig,
    /// Storage settings.
    pub storage: StorageConfig,
    /// Embedding model settings.
    pub embedding: EmbeddingConfig,
    /// Completion model settings.
    pub llm: LlmConfig,
    /// Idle sweep settings.
    pub sweep: SweepConfig,
}

impl MemoryConfig {
    /// Build a configuration from defaults overlaid with `DIALOGUE_*` environment variables.
    ///
    /// # Errors
    /// Returns an error if a numeric variable cannot be parsed.
    pub fn from_env() -> MemoryResult<Self> {
        let mut config = Self::default();

        if let Some(url) = env_string("DIALOGUE_REDIS_URL") {
            config.storage.redis_url = url;
        }
        if let Some(size) = env_parse::<usize>("DIALOGUE_REDIS_POOL_SIZE")? {
            config.storage.redis_pool_size = size;
        }
        if let Some(path) = env_string("DIALOGUE_SQLITE_PATH") {
            config.storage.sqlite_path = PathBuf::from(path);
        }
        if let Some(base_url) = env_string("DIALOGUE_OLLAMA_URL") {
            config.embedding.base_url = Some(base_url.clone());
            config.llm.base_url = Some(base_url);
        }
        if let Some(model) = env_string("DIALOGUE_EMBED_MODEL") {
            config.embedding.model = model;
        }
        if let Some(ndims) = env_parse::<usize>("DIALOGUE_EMBED_DIM")? {
            config.embedding.ndims = ndims;
        }
        if let Some(model) = env_string("DIALOGUE_LLM_MODEL") {
            config.llm.model = model;
        }
        if let Some(seconds) = env_parse::<u64>("DIALOGUE_IDLE_TIMEOUT_SECONDS")? {
            config.session.idle_timeout_seconds = seconds;
        }
        if let Some(seconds) = env_parse::<u64>("DIALOGUE_AUDIO_LOCK_TTL_SECONDS")? {
            config.audio.lock_ttl_seconds = seconds;
        }
        if let Some(rounds) = env_parse::<usize>("DIALOGUE_SUMMARY_CHUNK_SIZE")? {
            config.summary.chunk_rounds = rounds;
        }
        if let Some(seconds) = env_parse::<u64>("DIALOGUE_SWEEP_INTERVAL_SECONDS")? {
            config.sweep.interval_seconds = seconds;
        }
        if let Some(seconds) = env_parse::<u64>("DIALOGUE_SWEEP_RECLAIM_GRACE_SECONDS")? {
            config.sweep.reclaim_grace_seconds = seconds;
        }

        Ok(config)
    }

    /// Validate configuration invariants.
    ///
    /// # Errors
    /// Returns an error if any values are out of range or invalid.
    pub fn validate(&self) -> MemoryResult<()> {
        if self.session.idle_timeout_seconds == 0 {
            return Err(MemoryError::InvalidConfig(
                "session.idle_timeout_seconds must be > 0".to_string(),
            ));
        }

        if self.session.data_ttl_seconds == 0 {
            return Err(MemoryError::InvalidConfig(
                "session.data_ttl_seconds must be > 0".to_string(),
            ));
        }

        if self.dedupe.ttl_seconds == 0 {
            return Err(MemoryError::InvalidConfig(
                "dedupe.ttl_seconds must be > 0".to_string(),
            ));
        }

        if self.summary.chunk_rounds == 0 || self.summary.refine_chunk_rounds == 0 {
            return Err(MemoryError::InvalidConfig(
                "summary chunk sizes must be > 0".to_string(),
            ));
        }

        if self.audio.lock_ttl_seconds == 0 {
            return Err(MemoryError::InvalidConfig(
                "audio.lock_ttl_seconds must be > 0".to_string(),
            ));
        }

        if self.retrieval.top_k == 0 {
            return Err(MemoryError::InvalidConfig(
                "retrieval.top_k must be > 0".to_string(),
            ));
        }

        if !(-1.0..=1.0).contains(&self.retrieval.min_similarity) {
            return Err(MemoryError::InvalidConfig(
                "retrieval.min_similarity must be within [-1, 1]".to_string(),
            ));
        }

        if self.scoring.recency_half_life_days <= 0.0 {
            return Err(MemoryError::InvalidConfig(
                "scoring.recency_half_life_days must be > 0".to_string(),
            ));
        }

        let weights = self.scoring.weight_sum();
        if (weights - 1.0).abs() > 1e-6 {
            return Err(MemoryError::InvalidConfig(format!(
                "scoring weights must sum to 1.0 (got {weights})"
            )));
        }

        if self.prompt.max_chars == 0 {
            return Err(MemoryError::InvalidConfig(
                "prompt.max_chars must be > 0".to_string(),
            ));
        }

        if self.embedding.ndims == 0 {
            return Err(MemoryError::InvalidConfig(
                "embedding.ndims must be > 0".to_string(),
            ));
        }

        if self.storage.redis_pool_size == 0 {
            return Err(MemoryError::InvalidConfig(
                "storage.redis_pool_size must be > 0".to_string(),
            ));
        }

        if !self
            .storage
            .memory_table
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            return Err(MemoryError::InvalidConfig(
                "storage.memory_table must be [A-Za-z0-9_]".to_string(),
            ));
        }

        Url::parse(&self.storage.redis_url)?;

        if let Some(base_url) = &self.embedding.base_url {
            Url::parse(base_url)?;
        }

        if let Some(base_url) = &self.llm.base_url {
            Url::parse(base_url)?;
        }

        Ok(())
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> MemoryResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    env_string(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|err| MemoryError::InvalidConfig(format!("{name}: {err}")))
        })
        .transpose()
}

/// Session activity and retention settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sliding TTL of the active marker; a session idle this long is finalized.
    pub idle_timeout_seconds: u64,
    /// TTL applied to the conversation ledger, refreshed on every append.
    pub data_ttl_seconds: u64,
}

impl SessionConfig {
    /// Idle timeout as a [`Duration`].
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    /// Ledger TTL as a [`Duration`].
    #[must_use]
    pub const fn data_ttl(&self) -> Duration {
        Duration::from_secs(self.data_ttl_seconds)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: 300,
            data_ttl_seconds: 86_400,
        }
    }
}

/// Request idempotency settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupeConfig {
    /// How long a processed request id suppresses exact duplicates.
    pub ttl_seconds: u64,
    /// Bucket width used when deriving request ids from message text.
    pub bucket_ms: i64,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 86_400,
            bucket_ms: 3_000,
        }
    }
}

/// Summary settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    /// Rounds folded into the rolling summary per commit.
    pub chunk_rounds: usize,
    /// Rounds per map step of the final re-summarization.
    pub refine_chunk_rounds: usize,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            chunk_rounds: 5,
            refine_chunk_rounds: 20,
        }
    }
}

/// Streamed audio reassembly settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// TTL of a partial-fragment buffer; abandoned buffers expire on their own.
    pub fragment_ttl_seconds: u64,
    /// TTL of the per-clip processing lock.
    ///
    /// Must exceed the worst-case latency of producing a reply (safety check,
    /// retrieval, generation and the rolling fold). 180 s covers long voice
    /// messages against a remote model; raise it if replies can take longer,
    /// otherwise a second worker may reprocess a clip whose lock expired.
    pub lock_ttl_seconds: u64,
    /// TTL of the cached final reply.
    pub result_ttl_seconds: u64,
    /// Reply returned to duplicate submissions while the clip is processed.
    pub processing_placeholder: String,
    /// Reply returned when a non-final fragment is buffered.
    pub fragment_ack: String,
}

impl AudioConfig {
    /// Lock TTL as a [`Duration`].
    #[must_use]
    pub const fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_seconds)
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            fragment_ttl_seconds: 3_600,
            lock_ttl_seconds: 180,
            result_ttl_seconds: 86_400,
            processing_placeholder: "I'm still working on your voice message, one moment please."
                .to_string(),
            fragment_ack: "Got your voice fragment.".to_string(),
        }
    }
}

/// Retrieval settings for long-term memory.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Number of memories to retrieve.
    pub top_k: usize,
    /// Minimum cosine similarity to keep a hit.
    pub min_similarity: f64,
    /// Over-fetch multiplier applied to `top_k` before filtering.
    pub overfetch_factor: usize,
    /// Lower bound of the over-fetch limit.
    pub overfetch_min: usize,
    /// Upper bound of the over-fetch limit.
    pub overfetch_max: usize,
}

impl RetrievalConfig {
    /// Candidate count requested from the vector index for a given `top_k`.
    #[must_use]
    pub fn candidate_limit(&self, top_k: usize) -> usize {
        top_k
            .saturating_mul(self.overfetch_factor)
            .max(self.overfetch_min)
            .min(self.overfetch_max)
            .max(top_k)
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_similarity: 0.55,
            overfetch_factor: 4,
            overfetch_min: 5,
            overfetch_max: 20,
        }
    }
}

/// Ranking coefficients for retrieval results.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Similarity weight.
    pub w_similarity: f64,
    /// Recency weight.
    pub w_recency: f64,
    /// Importance weight.
    pub w_importance: f64,
    /// Usage frequency weight.
    pub w_frequency: f64,
    /// Recency decay constant in days: the recency term is `exp(-age_days / value)`.
    pub recency_half_life_days: f64,
}

impl ScoringConfig {
    /// Sum of the four weights.
    #[must_use]
    pub fn weight_sum(&self) -> f64 {
        self.w_similarity + self.w_recency + self.w_importance + self.w_frequency
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            w_similarity: 0.64,
            w_recency: 0.18,
            w_importance: 0.12,
            w_frequency: 0.06,
            recency_half_life_days: 45.0,
        }
    }
}

/// Extraction settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// Max atoms kept from one extraction.
    pub max_atoms: usize,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self { max_atoms: 5 }
    }
}

/// Prompt construction settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Maximum prompt size in characters.
    pub max_chars: usize,
    /// Maximum running-summary size in characters.
    pub summary_max_chars: usize,
    /// Maximum size of the rendered unfolded tail in characters.
    pub short_term_max_chars: usize,
    /// Number of unfolded rounds offered to the prompt.
    pub tail_rounds: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            max_chars: 4_000,
            summary_max_chars: 3_000,
            short_term_max_chars: 1_800,
            tail_rounds: 6,
        }
    }
}

/// Storage configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Redis connection URL for the key-value store.
    pub redis_url: String,
    /// Maximum pooled Redis connections.
    pub redis_pool_size: usize,
    /// `SQLite` database path for the vector index.
    pub sqlite_path: PathBuf,
    /// Long-term memory table name.
    pub memory_table: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            redis_pool_size: 16,
            sqlite_path: PathBuf::from("memory.sqlite"),
            memory_table: "user_memory".to_string(),
        }
    }
}

/// Embedding model settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Ollama embedding model name.
    pub model: String,
    /// Embedding vector dimensions; must match the vector index.
    pub ndims: usize,
    /// Optional custom base URL.
    pub base_url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "nomic-embed-text".to_string(),
            ndims: 768,
            base_url: None,
        }
    }
}

/// Completion model settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Ollama completion model name.
    pub model: String,
    /// Temperature for reply generation.
    pub temperature: f64,
    /// Optional max tokens.
    pub max_tokens: Option<u64>,
    /// Optional custom base URL.
    pub base_url: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "ministral-3:8b-instruct-2512-q8_0".to_string(),
            temperature: 0.5,
            max_tokens: None,
            base_url: None,
        }
    }
}

/// Idle sweep settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Interval between sweeps.
    pub interval_seconds: u64,
    /// Whether the sweeper runs at all.
    pub enabled: bool,
    /// Extra time past the idle timeout after which a session still marked
    /// finalizing is taken over.
    pub reclaim_grace_seconds: u64,
}

impl SweepConfig {
    /// Reclaim grace as a [`Duration`].
    #[must_use]
    pub const fn reclaim_grace(&self) -> Duration {
        Duration::from_secs(self.reclaim_grace_seconds)
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            enabled: true,
            reclaim_grace_seconds: 180,
        }
    }
}
