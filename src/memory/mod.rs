//! Dialogue memory for stateless LLM companions.
//!
//! This module keeps per-user conversational state in a key-value store and
//! long-term facts in a vector index, organized into:
//! - `core`: Configuration, errors, identifiers and memory atoms
//! - `kv`: Key-value store trait, key layout, Redis and in-memory backends
//! - `ingest`: Turns, history ledger, activity, idempotency, audio and extraction
//! - `summarization`: Rolling summary cursor and LLM summarizer
//! - `embedding`: Embedding model abstraction and Ollama implementation
//! - `storage`: Vector index backends and the long-term memory store
//! - `retrieval`: Hybrid ranking of memory hits
//! - `prompt`: Budget enforcement and prompt block construction
//! - `engine`: Session lifecycle and the message pipeline
//! - `maintenance`: Idle session sweeper
//! - `adapters`: Reply generation and safety screening (Rig)

pub mod adapters;
pub mod core;
pub mod embedding;
pub mod engine;
pub mod ingest;
pub mod kv;
pub mod maintenance;
pub mod prompt;
pub mod retrieval;
pub mod storage;
pub mod summarization;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types for convenience
pub use adapters::{
    AllowAllClassifier, LlmSafetyClassifier, OllamaReplyGenerator, ReplyGenerator, ReplyRequest,
    SafetyClassifier, SafetyVerdict, init_tracing,
};
pub use core::{
    AtomCandidate, AtomStatus, AudioId, MemoryAtom, MemoryConfig, MemoryError, MemoryResult,
    RequestId, SessionId, UserId,
};
pub use embedding::{Embedder, OllamaEmbedder};
pub use engine::{
    ChatPipeline, FinalizeOutcome, FinalizeReport, IncomingMessage, MessageOutcome,
    SessionBackends, SessionLifecycle,
};
pub use ingest::{
    ActivityTracker, AudioOutcome, AudioReassembler, ConversationTurn, HistoryLedger,
    LlmAtomExtractor, MemoryExtractor, RequestDeduplicator, SessionState,
};
pub use kv::{InMemoryKvStore, KvStore, RedisKvStore};
pub use maintenance::{IdleSweeper, SweepStats};
pub use prompt::{PromptParts, build_prompt_block, enforce_budget};
pub use retrieval::{RankedMemory, rank_results};
pub use storage::{InMemoryVectorIndex, LongTermMemory, SqliteVectorIndex, VectorIndex};
pub use summarization::{FoldOutcome, LlmSummarizer, Summarizer, SummaryCursor};
