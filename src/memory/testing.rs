//! Deterministic collaborators shared by unit tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::memory::adapters::rig_adapter::{
    ReplyFuture, ReplyGenerator, ReplyRequest, SafetyClassifier, SafetyVerdict,
};
use crate::memory::core::atom::AtomCandidate;
use crate::memory::core::errors::{MemoryError, MemoryResult};
use crate::memory::embedding::embedder::{EmbedFuture, Embedder};
use crate::memory::ingest::extractor_llm::{ExtractFuture, MemoryExtractor};
use crate::memory::ingest::turn::ConversationTurn;
use crate::memory::summarization::llm_summarizer::{Summarizer, SummaryFuture};

/// Bag-of-words embedder: each word bumps one of [`Self::DIMS`] buckets.
pub struct KeywordEmbedder;

impl KeywordEmbedder {
    pub const DIMS: usize = 8;

    pub fn vector(text: &str) -> Vec<f32> {
        let mut out = vec![0.0_f32; Self::DIMS];
        for word in text.split_whitespace() {
            let word = word.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase();
            if word.is_empty() {
                continue;
            }
            let bucket = word
                .bytes()
                .fold(7_usize, |h, b| h.wrapping_mul(31).wrapping_add(usize::from(b)))
                % Self::DIMS;
            out[bucket] += 1.0;
        }
        out
    }
}

impl Embedder for KeywordEmbedder {
    fn embed<'a>(&'a self, text: &'a str) -> EmbedFuture<'a, MemoryResult<Vec<f32>>> {
        Box::pin(async move { Ok(Self::vector(text)) })
    }

    fn embed_texts(&self, texts: Vec<String>) -> EmbedFuture<'_, MemoryResult<Vec<Vec<f32>>>> {
        Box::pin(async move { Ok(texts.iter().map(|t| Self::vector(t)).collect()) })
    }

    fn ndims(&self) -> usize {
        Self::DIMS
    }
}

/// Summarizer that lists the inputs it saw and counts its calls.
#[derive(Default)]
pub struct RecordingSummarizer {
    pub calls: AtomicUsize,
    pub fail: bool,
}

impl RecordingSummarizer {
    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: true,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Summarizer for RecordingSummarizer {
    fn summarize<'a>(
        &'a self,
        rounds: &'a [ConversationTurn],
    ) -> SummaryFuture<'a, MemoryResult<String>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(MemoryError::Collaborator("summarizer offline".to_string()));
            }
            let inputs: Vec<&str> = rounds.iter().map(|r| r.input.as_str()).collect();
            Ok(format!("talked about {}", inputs.join(", ")))
        })
    }

    fn combine<'a>(&'a self, parts: &'a [String]) -> SummaryFuture<'a, MemoryResult<String>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(MemoryError::Collaborator("summarizer offline".to_string()));
            }
            Ok(parts.join(" | "))
        })
    }
}

/// Extractor returning a fixed answer and remembering its input.
#[derive(Default)]
pub struct FixedExtractor {
    pub candidates: Vec<AtomCandidate>,
    pub fail: bool,
    pub seen: Mutex<Vec<String>>,
}

impl FixedExtractor {
    pub fn new(candidates: Vec<AtomCandidate>) -> Self {
        Self {
            candidates,
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

impl MemoryExtractor for FixedExtractor {
    fn extract<'a>(
        &'a self,
        summary: &'a str,
    ) -> ExtractFuture<'a, MemoryResult<Vec<AtomCandidate>>> {
        Box::pin(async move {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(summary.to_string());
            }
            if self.fail {
                return Err(MemoryError::Collaborator("extractor offline".to_string()));
            }
            Ok(self.candidates.clone())
        })
    }
}

/// Reply generator echoing the user message.
#[derive(Default)]
pub struct EchoReply {
    pub requests: Mutex<Vec<ReplyRequest>>,
}

impl EchoReply {
    pub fn last_request(&self) -> Option<ReplyRequest> {
        self.requests.lock().ok().and_then(|r| r.last().cloned())
    }
}

impl ReplyGenerator for EchoReply {
    fn generate<'a>(&'a self, request: &'a ReplyRequest) -> ReplyFuture<'a, MemoryResult<String>> {
        Box::pin(async move {
            if let Ok(mut requests) = self.requests.lock() {
                requests.push(request.clone());
            }
            Ok(match &request.block_reason {
                Some(_) => "I can't help with that, please ask your doctor.".to_string(),
                None => format!("echo: {}", request.user_message),
            })
        })
    }
}

/// Blocks any message containing `word`.
pub struct WordBlocker {
    pub word: &'static str,
}

impl SafetyClassifier for WordBlocker {
    fn classify<'a>(&'a self, text: &'a str) -> ReplyFuture<'a, MemoryResult<SafetyVerdict>> {
        Box::pin(async move {
            Ok(if text.contains(self.word) {
                SafetyVerdict {
                    blocked: true,
                    reason: format!("mentions {}", self.word),
                }
            } else {
                SafetyVerdict::allow()
            })
        })
    }
}
