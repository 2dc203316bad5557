//! Ingestion: turns, history, activity, idempotency, audio and extraction.

pub mod activity;
pub mod audio;
pub mod dedupe;
pub mod extractor_llm;
pub mod ledger;
pub mod turn;

pub use activity::{ActivityTracker, SessionState};
pub use audio::{AudioOutcome, AudioReassembler, merge_fragments};
pub use dedupe::RequestDeduplicator;
pub use extractor_llm::{ExtractFuture, LlmAtomExtractor, MemoryExtractor, parse_atom_candidates};
pub use ledger::HistoryLedger;
pub use turn::ConversationTurn;
