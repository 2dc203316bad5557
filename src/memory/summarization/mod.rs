//! Rolling summarization of the conversation history.

pub mod cursor;
pub mod llm_summarizer;

pub use cursor::{FoldOutcome, FoldWindow, SummaryCursor, append_summary};
pub use llm_summarizer::{ConcatSummarizer, LlmSummarizer, Summarizer, SummaryFuture};
