//! Summarization of conversation rounds.
//!
//! [`LlmSummarizer`] asks an Ollama model for a compact summary;
//! [`ConcatSummarizer`] is the deterministic, model-free fallback.

use std::future::Future;
use std::pin::Pin;

use reqwest::Client as ReqwestClient;
use rig::client::CompletionClient;
use rig::completion::CompletionModel;
use rig::message::AssistantContent;
use rig::providers::ollama;
use tracing::debug;

use crate::memory::core::config::LlmConfig;
use crate::memory::core::errors::{MemoryError, MemoryResult};
use crate::memory::ingest::turn::ConversationTurn;

/// Boxed future type for summarizer operations.
pub type SummaryFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Produces summaries of conversation rounds.
pub trait Summarizer: Send + Sync {
    /// Summarize consecutive rounds.
    ///
    /// # Errors
    /// Returns an error if the underlying model call fails.
    fn summarize<'a>(
        &'a self,
        rounds: &'a [ConversationTurn],
    ) -> SummaryFuture<'a, MemoryResult<String>>;

    /// Merge partial summaries, in order, into one.
    ///
    /// # Errors
    /// Returns an error if the underlying model call fails.
    fn combine<'a>(&'a self, parts: &'a [String]) -> SummaryFuture<'a, MemoryResult<String>>;
}

/// System prompt for LLM summarization.
const SUMMARY_SYSTEM_PROMPT: &str = r"You summarize conversations between a user and a care assistant.
Write a compact factual summary in the language of the conversation.

Keep:
- facts about the user (health, medication, allergies, family, habits)
- preferences and constraints the user stated
- open questions or follow-ups the assistant promised

Rules:
- Maximum 200 words
- Never invent anything that is not in the conversation
- Plain sentences, no headings";

const COMBINE_SYSTEM_PROMPT: &str = r"You merge partial summaries of one conversation, given in chronological order, into a single summary.
Remove repetition, keep every distinct fact, prefer later information when facts conflict.
Maximum 300 words, plain sentences, no headings.";

/// LLM-based summarizer for conversation rounds.
pub struct LlmSummarizer {
    model: ollama::CompletionModel,
    max_input_chars: usize,
    max_output_chars: usize,
}

impl LlmSummarizer {
    /// Create a new LLM summarizer.
    ///
    /// # Errors
    /// Returns an error if the Ollama client cannot be built.
    pub fn new(config: &LlmConfig, max_output_chars: usize) -> MemoryResult<Self> {
        let builder = ollama::Client::<ReqwestClient>::builder().api_key(rig::client::Nothing);
        let builder = if let Some(base_url) = &config.base_url {
            builder.base_url(base_url)
        } else {
            builder
        };
        let client = builder.build().map_err(MemoryError::from)?;
        let model = client.completion_model(config.model.clone());

        Ok(Self {
            model,
            max_input_chars: 8000,
            max_output_chars,
        })
    }

    async fn complete(&self, preamble: &str, prompt: String) -> MemoryResult<String> {
        let request = self
            .model
            .completion_request(prompt)
            .preamble(preamble.to_string())
            .temperature(0.3)
            .build();

        let response = self.model.completion(request).await?;
        let text = extract_text(&response.choice);
        Ok(truncate_to_chars(text.trim(), self.max_output_chars))
    }
}

impl Summarizer for LlmSummarizer {
    fn summarize<'a>(
        &'a self,
        rounds: &'a [ConversationTurn],
    ) -> SummaryFuture<'a, MemoryResult<String>> {
        Box::pin(async move {
            if rounds.is_empty() {
                return Ok(String::new());
            }
            let transcript = format_rounds(rounds, self.max_input_chars);
            debug!("Summarizing {} rounds with LLM", rounds.len());
            let prompt = format!("Summarize the following conversation:\n\n{transcript}");
            self.complete(SUMMARY_SYSTEM_PROMPT, prompt).await
        })
    }

    fn combine<'a>(&'a self, parts: &'a [String]) -> SummaryFuture<'a, MemoryResult<String>> {
        Box::pin(async move {
            let parts: Vec<&str> = parts
                .iter()
                .map(|part| part.trim())
                .filter(|part| !part.is_empty())
                .collect();
            match parts.as_slice() {
                [] => Ok(String::new()),
                [single] => Ok((*single).to_string()),
                _ => {
                    let numbered = parts
                        .iter()
                        .enumerate()
                        .map(|(i, part)| format!("Part {}:\n{part}", i + 1))
                        .collect::<Vec<_>>()
                        .join("\n\n");
                    let prompt = truncate_to_chars(&numbered, self.max_input_chars);
                    debug!("Combining {} partial summaries with LLM", parts.len());
                    self.complete(COMBINE_SYSTEM_PROMPT, prompt).await
                }
            }
        })
    }
}

/// Model-free summarizer: the rounds themselves, truncated.
#[derive(Clone, Debug)]
pub struct ConcatSummarizer {
    max_chars: usize,
}

impl ConcatSummarizer {
    /// Create a summarizer producing at most `max_chars` characters.
    #[must_use]
    pub const fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

impl Summarizer for ConcatSummarizer {
    fn summarize<'a>(
        &'a self,
        rounds: &'a [ConversationTurn],
    ) -> SummaryFuture<'a, MemoryResult<String>> {
        Box::pin(async move { Ok(format_rounds(rounds, self.max_chars).trim_end().to_string()) })
    }

    fn combine<'a>(&'a self, parts: &'a [String]) -> SummaryFuture<'a, MemoryResult<String>> {
        Box::pin(async move {
            let joined = parts
                .iter()
                .map(|part| part.trim())
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join("\n\n");
            Ok(truncate_to_chars(&joined, self.max_chars))
        })
    }
}

/// Extract text from assistant response.
fn extract_text(choice: &rig::OneOrMany<AssistantContent>) -> String {
    let mut out = String::new();
    for content in choice.iter() {
        if let AssistantContent::Text(text) = content {
            out.push_str(&text.text);
        }
    }
    out
}

/// Format rounds into a readable transcript.
#[must_use]
pub fn format_rounds(rounds: &[ConversationTurn], max_chars: usize) -> String {
    let mut output = String::new();
    let mut char_count = 0;

    for round in rounds {
        let mut block = String::new();
        if !round.input.is_empty() {
            block.push_str(&format!("User: {}\n", round.input));
        }
        block.push_str(&format!("Assistant: {}\n", round.output));
        let block_len = block.chars().count();

        if char_count + block_len > max_chars {
            let remaining = max_chars.saturating_sub(char_count).saturating_sub(3);
            let truncated: String = block.chars().take(remaining).collect();
            output.push_str(&truncated);
            output.push_str("...");
            break;
        }

        output.push_str(&block);
        char_count += block_len;
    }

    output
}

/// Truncate a string to a maximum number of characters.
fn truncate_to_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}
