//! Prompt budget enforcement utilities.

use crate::memory::core::config::PromptConfig;
use crate::memory::ingest::turn::ConversationTurn;
use crate::memory::prompt::prompt_builder::{build_prompt_block, render_tail};

/// Sections shorter than this are dropped instead of shrunk.
const MIN_SUMMARY_CHARS: usize = 200;

/// Prompt parts before formatting.
#[derive(Clone, Debug, Default)]
pub struct PromptParts {
    /// Rendered long-term memory pack.
    pub memory_pack: String,
    /// Running summary.
    pub summary: String,
    /// Unfolded recent rounds, oldest first.
    pub tail: Vec<ConversationTurn>,
    /// Current user message.
    pub user_message: String,
}

impl PromptParts {
    /// Assemble parts, applying the per-section limits of `config`.
    #[must_use]
    pub fn new(
        config: &PromptConfig,
        memory_pack: String,
        summary: &str,
        mut tail: Vec<ConversationTurn>,
        user_message: String,
    ) -> Self {
        let skip = tail.len().saturating_sub(config.tail_rounds);
        tail.drain(..skip);
        while tail.len() > 1 && render_tail(&tail).chars().count() > config.short_term_max_chars {
            tail.remove(0);
        }

        Self {
            memory_pack,
            summary: shrink_tail(summary.trim(), config.summary_max_chars),
            tail,
            user_message,
        }
    }

    /// Character count of the rendered block.
    #[must_use]
    pub fn rendered_len(&self) -> usize {
        build_prompt_block(self).chars().count()
    }
}

/// Keep the last `max_chars` characters of `text`, starting on a paragraph
/// boundary when one falls inside the kept part.
#[must_use]
pub fn shrink_tail(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let tail: String = text.chars().skip(total - max_chars).collect();
    match tail.find("\n\n") {
        Some(idx) if idx + 2 < tail.len() => tail[idx + 2..].to_string(),
        _ => tail,
    }
}

/// Enforce the prompt budget: shrink the summary first, then drop the oldest
/// tail rounds. The memory pack and user message are kept.
#[must_use]
pub fn enforce_budget(mut parts: PromptParts, max_chars: usize) -> PromptParts {
    loop {
        let actual_len = parts.rendered_len();
        if actual_len <= max_chars {
            break;
        }
        let excess = actual_len - max_chars;

        if !parts.summary.is_empty() {
            let keep = parts.summary.chars().count().saturating_sub(excess);
            if keep < MIN_SUMMARY_CHARS {
                parts.summary.clear();
            } else {
                parts.summary = shrink_tail(&parts.summary, keep);
            }
            continue;
        }

        if !parts.tail.is_empty() {
            parts.tail.remove(0);
            continue;
        }

        break;
    }

    parts
}
