//! LLM-assisted memory atom extraction from a session summary.

use std::future::Future;
use std::pin::Pin;

use reqwest::Client as ReqwestClient;
use rig::client::CompletionClient;
use rig::completion::CompletionModel;
use rig::message::AssistantContent;
use rig::providers::ollama;
use serde_json::Value;
use tracing::{debug, warn};

use crate::memory::core::atom::AtomCandidate;
use crate::memory::core::config::{ExtractorConfig, LlmConfig};
use crate::memory::core::errors::{MemoryError, MemoryResult};

/// Boxed future type for extractor operations.
pub type ExtractFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Turns a session summary into durable memory atoms.
pub trait MemoryExtractor: Send + Sync {
    /// Extract candidate atoms. An empty list means nothing worth keeping.
    ///
    /// # Errors
    /// Returns an error if the underlying model call fails.
    fn extract<'a>(
        &'a self,
        summary: &'a str,
    ) -> ExtractFuture<'a, MemoryResult<Vec<AtomCandidate>>>;
}

const EXTRACT_SYSTEM_PROMPT: &str = r#"You extract long-term memories about the user from a conversation summary.
Return a strict JSON array. Each element has the fields:
  "type": short category such as allergy, condition, medication, preference, habit, family, goal, other
  "normKey": short stable snake_case key identifying the fact inside its type
  "text": one self-contained sentence stating the fact
  "importance": integer 1 (trivia) to 5 (safety critical)
  "confidence": number between 0 and 1
Only include durable facts about the user. Never include greetings or one-off requests.
Return [] if nothing should be stored."#;

/// Ollama-backed extractor.
pub struct LlmAtomExtractor {
    model: ollama::CompletionModel,
    max_atoms: usize,
}

impl LlmAtomExtractor {
    /// Create a new extractor using the completion model config.
    ///
    /// # Errors
    /// Returns an error if the Ollama client cannot be built.
    pub fn new(llm: &LlmConfig, extractor: &ExtractorConfig) -> MemoryResult<Self> {
        let builder = ollama::Client::<ReqwestClient>::builder().api_key(rig::client::Nothing);
        let builder = if let Some(base_url) = &llm.base_url {
            builder.base_url(base_url)
        } else {
            builder
        };
        let client = builder.build().map_err(MemoryError::from)?;
        let model = client.completion_model(llm.model.clone());
        Ok(Self {
            model,
            max_atoms: extractor.max_atoms,
        })
    }
}

impl MemoryExtractor for LlmAtomExtractor {
    fn extract<'a>(
        &'a self,
        summary: &'a str,
    ) -> ExtractFuture<'a, MemoryResult<Vec<AtomCandidate>>> {
        Box::pin(async move {
            if summary.trim().is_empty() {
                return Ok(Vec::new());
            }

            let prompt = format!("Conversation summary:\n\n{summary}\n\nReturn the JSON array.");
            let request = self
                .model
                .completion_request(prompt)
                .preamble(EXTRACT_SYSTEM_PROMPT.to_string())
                .temperature(0.0)
                .build();

            let response = self.model.completion(request).await?;
            let text = extract_text(&response.choice);
            let atoms = parse_atom_candidates(&text, self.max_atoms);
            debug!(count = atoms.len(), "memory atoms extracted");
            Ok(atoms)
        })
    }
}

/// Parse a model answer into atom candidates.
///
/// Tolerates Markdown code fences and prose around the JSON. A bare object is
/// read as a one-element list. Elements that do not decode are skipped; a
/// malformed answer yields an empty list. At most `max_atoms` candidates are
/// kept.
#[must_use]
pub fn parse_atom_candidates(raw: &str, max_atoms: usize) -> Vec<AtomCandidate> {
    let cleaned: String = raw
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n");

    let Some(elements) = json_elements(&cleaned) else {
        warn!("extractor returned malformed JSON");
        return Vec::new();
    };

    elements
        .into_iter()
        .filter_map(|element| match serde_json::from_value::<AtomCandidate>(element) {
            Ok(candidate) => Some(candidate),
            Err(err) => {
                warn!(?err, "skipping malformed memory atom");
                None
            }
        })
        .filter(|candidate| !candidate.text.trim().is_empty())
        .take(max_atoms)
        .collect()
}

fn json_elements(cleaned: &str) -> Option<Vec<Value>> {
    let array_start = cleaned.find('[');
    let object_start = cleaned.find('{');
    let (open, close) = match (array_start, object_start) {
        (Some(a), Some(o)) if o < a => ('{', '}'),
        (Some(_), _) => ('[', ']'),
        (None, Some(_)) => ('{', '}'),
        (None, None) => return None,
    };

    let start = cleaned.find(open)?;
    let end = cleaned.rfind(close)?;
    if end < start {
        return None;
    }

    match serde_json::from_str::<Value>(&cleaned[start..=end]).ok()? {
        Value::Array(elements) => Some(elements),
        object @ Value::Object(_) => Some(vec![object]),
        _ => None,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fenced_array() {
        let raw = "Here you go:\n```json\n[{\"type\":\"allergy\",\"normKey\":\"penicillin\",\"text\":\"Allergic to penicillin\",\"importance\":5,\"confidence\":0.9}]\n```";
        let atoms = parse_atom_candidates(raw, 5);
        assert_eq!(atoms.len(), 1);
        assert_eq!(atoms[0].atom_type.as_deref(), Some("allergy"));
        assert_eq!(atoms[0].importance, Some(5));
    }

    #[test]
    fn test_parse_caps_and_skips_blank() {
        let items: Vec<String> = (0..8)
            .map(|i| format!("{{\"text\":\"fact {i}\"}}"))
            .chain(std::iter::once("{\"text\":\"  \"}".to_string()))
            .collect();
        let raw = format!("[{}]", items.join(","));
        assert_eq!(parse_atom_candidates(&raw, 5).len(), 5);
    }

    #[test]
    fn test_parse_keeps_atoms_with_loose_numbers() {
        let raw = r#"[{"type":"diet","normKey":"light","text":"Prefers light dinners","importance":4,"confidence":0.9},
                      {"type":"habit","normKey":"walk","text":"Walks after lunch","importance":3.5,"confidence":"0.6"}]"#;
        let atoms = parse_atom_candidates(raw, 5);
        assert_eq!(atoms.len(), 2);
        assert_eq!(atoms[1].importance, Some(4));
        assert_eq!(atoms[1].confidence, Some(0.6));
    }

    #[test]
    fn test_parse_skips_only_bad_elements() {
        let raw = r#"[{"text":"Likes jazz"}, 42, {"text":["not","a","string"]}, {"text":"Has a cat"}]"#;
        let texts: Vec<String> = parse_atom_candidates(raw, 5)
            .into_iter()
            .map(|c| c.text)
            .collect();
        assert_eq!(texts, vec!["Likes jazz", "Has a cat"]);
    }

    #[test]
    fn test_parse_single_object() {
        let raw = "```json\n{\"type\":\"family\",\"text\":\"Daughter is called Ana\",\"timesSeen\":3}\n```";
        let atoms = parse_atom_candidates(raw, 5);
        assert_eq!(atoms.len(), 1);
        assert_eq!(atoms[0].times_seen, Some(3));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_atom_candidates("no memories", 5).is_empty());
        assert!(parse_atom_candidates("] oops [", 5).is_empty());
        assert!(parse_atom_candidates("[{\"text\": }]", 5).is_empty());
        assert!(parse_atom_candidates("[]", 5).is_empty());
    }
}
