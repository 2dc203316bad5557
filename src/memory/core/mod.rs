//! Core memory types and identifiers.

pub mod atom;
pub mod config;
pub mod errors;
pub mod ids;

pub use atom::{AtomCandidate, AtomDraft, AtomStatus, MemoryAtom, atom_primary_key};
pub use config::{
    AudioConfig, DedupeConfig, EmbeddingConfig, ExtractorConfig, LlmConfig, MemoryConfig,
    PromptConfig, RetrievalConfig, ScoringConfig, SessionConfig, StorageConfig, SummaryConfig,
    SweepConfig,
};
pub use errors::{MemoryError, MemoryResult};
pub use ids::{AudioId, IdError, RequestId, SessionId, UserId};
