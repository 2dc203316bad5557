//! Rig + Ollama collaborators for reply generation and safety screening.

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

/// Boxed future type for reply and safety calls.
pub type ReplyFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Initialize tracing with a basic subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
}

/// Input of one reply generation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplyRequest {
    /// Prompt block ending with the user message; empty when blocked.
    pub context: String,
    /// Merged user message.
    pub user_message: String,
    /// Why the safety screen blocked the message, if it did.
    pub block_reason: Option<String>,
}

impl ReplyRequest {
    /// Whether the reply must decline.
    #[must_use]
    pub const fn is_blocked(&self) -> bool {
        self.block_reason.is_some()
    }
}

/// Produces the assistant reply.
pub trait ReplyGenerator: Send + Sync {
    /// Generate a reply.
    ///
    /// # Errors
    /// Returns an error if the model call fails.
    fn generate<'a>(&'a self, request: &'a ReplyRequest) -> ReplyFuture<'a, MemoryResult<String>>;
}

/// Outcome of a safety screen.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SafetyVerdict {
    /// Whether the message must be declined.
    pub blocked: bool,
    /// Reason given by the classifier.
    pub reason: String,
}

impl SafetyVerdict {
    /// A verdict that lets the message through.
    #[must_use]
    pub const fn allow() -> Self {
        Self {
            blocked: false,
            reason: String::new(),
        }
    }

    /// Parse an `OK` / `BLOCK: <reason>` answer. Anything else is allowed.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.strip_prefix("BLOCK:") {
            Some(reason) => Self {
                blocked: true,
                reason: reason.trim().to_string(),
            },
            None => Self::allow(),
        }
    }
}

/// Screens user messages before any retrieval or reply.
pub trait SafetyClassifier: Send + Sync {
    /// Classify a message.
    ///
    /// # Errors
    /// Returns an error if the classifier is unavailable.
    fn classify<'a>(&'a self, text: &'a str) -> ReplyFuture<'a, MemoryResult<SafetyVerdict>>;
}

/// Classifier that never blocks.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAllClassifier;

impl SafetyClassifier for AllowAllClassifier {
    fn classify<'a>(&'a self, _text: &'a str) -> ReplyFuture<'a, MemoryResult<SafetyVerdict>> {
        Box::pin(async { Ok(SafetyVerdict::allow()) })
    }
}

const REPLY_SYSTEM_PROMPT: &str = r"You are a warm, practical care companion.
Answer the latest user message in one to three short sentences, like a family member would.
Use the context when it is relevant and mention remembered facts naturally.
Never give diagnoses or dosages. Say honestly when you do not know something.";

const DECLINE_SYSTEM_PROMPT: &str = r"You are a warm care companion.
The latest user message is outside what you may help with.
Decline gently in one or two sentences, give no concrete instructions, diagnoses or dosages,
and only suggest asking a qualified doctor or pharmacist.";

const GUARD_SYSTEM_PROMPT: &str = r"You screen messages sent to a care companion.
Answer exactly OK when the message is safe to answer.
Answer BLOCK: <reason> when it asks for illegal, adult, or concrete medical instructions such as diagnoses, medication or dosages.
Answer with nothing else.";

fn build_client(config: &LlmConfig) -> MemoryResult<ollama::Client<ReqwestClient>> {
    let builder = ollama::Client::<ReqwestClient>::builder().api_key(rig::client::Nothing);
    let builder = if let Some(base_url) = &config.base_url {
        builder.base_url(base_url)
    } else {
        builder
    };
    builder.build().map_err(MemoryError::from)
}

/// Ollama-backed reply generator.
pub struct OllamaReplyGenerator {
    model: ollama::CompletionModel,
    temperature: f64,
    max_tokens: Option<u64>,
}

impl OllamaReplyGenerator {
    /// Create a generator from the completion model config.
    ///
    /// # Errors
    /// Returns an error if the Ollama client cannot be built.
    pub fn new(config: &LlmConfig) -> MemoryResult<Self> {
        let client = build_client(config)?;
        Ok(Self {
            model: client.completion_model(config.model.clone()),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

impl ReplyGenerator for OllamaReplyGenerator {
    fn generate<'a>(&'a self, request: &'a ReplyRequest) -> ReplyFuture<'a, MemoryResult<String>> {
        Box::pin(async move {
            let (preamble, prompt, temperature) = match &request.block_reason {
                Some(reason) => (
                    DECLINE_SYSTEM_PROMPT,
                    format!(
                        "The message was declined ({reason}).\n\nUser message:\n{}",
                        request.user_message
                    ),
                    0.2,
                ),
                None => (
                    REPLY_SYSTEM_PROMPT,
                    format!(
                        "Current time: {}\n\n{}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        request.context
                    ),
                    self.temperature,
                ),
            };

            let completion = self
                .model
                .completion_request(prompt)
                .preamble(preamble.to_string())
                .temperature(temperature)
                .max_tokens_opt(self.max_tokens)
                .build();
            let response = self.model.completion(completion).await?;
            let text = extract_text(&response.choice);
            debug!(blocked = request.is_blocked(), chars = text.len(), "reply generated");
            Ok(text.trim().to_string())
        })
    }
}

/// Ollama-backed safety classifier.
pub struct LlmSafetyClassifier {
    model: ollama::CompletionModel,
}

impl LlmSafetyClassifier {
    /// Create a classifier from the completion model config.
    ///
    /// # Errors
    /// Returns an error if the Ollama client cannot be built.
    pub fn new(config: &LlmConfig) -> MemoryResult<Self> {
        let client = build_client(config)?;
        Ok(Self {
            model: client.completion_model(config.model.clone()),
        })
    }
}

impl SafetyClassifier for LlmSafetyClassifier {
    fn classify<'a>(&'a self, text: &'a str) -> ReplyFuture<'a, MemoryResult<SafetyVerdict>> {
        Box::pin(async move {
            let request = self
                .model
                .completion_request(format!("Message:\n{text}"))
                .preamble(GUARD_SYSTEM_PROMPT.to_string())
                .temperature(0.0)
                .build();
            let response = self.model.completion(request).await?;
            Ok(SafetyVerdict::parse(&extract_text(&response.choice)))
        })
    }
}

fn extract_text(choice: &rig::OneOrMany<AssistantContent>) -> String {
    let mut out = String::new();
    for content in choice.iter() {
        if let AssistantContent::Text(text) = content {
            out.push_str(&text.text);
        }
    }
    out
}
