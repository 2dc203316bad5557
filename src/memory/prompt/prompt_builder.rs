//! Prompt builder for conversation context.

use crate::memory::ingest::turn::ConversationTurn;
use crate::memory::prompt::prompt_budget::PromptParts;

/// Build a deterministic prompt block from prepared parts.
#[must_use]
pub fn build_prompt_block(parts: &PromptParts) -> String {
    let mut out = String::new();

    out.push_str("[MEMORY_RELEVANT]\n");
    push_section(&mut out, &parts.memory_pack);

    out.push_str("[MEMORY_SUMMARY]\n");
    push_section(&mut out, &parts.summary);

    out.push_str("[SHORT_TERM]\n");
    out.push_str(&render_tail(&parts.tail));

    out.push_str("[USER_MESSAGE]\n");
    out.push_str(&parts.user_message);
    out.push('\n');

    out
}

/// Render rounds as `User:` / `Assistant:` lines.
#[must_use]
pub fn render_tail(turns: &[ConversationTurn]) -> String {
    let mut out = String::new();
    for turn in turns {
        if !turn.input.is_empty() {
            out.push_str("- User: ");
            out.push_str(&turn.input);
            out.push('\n');
        }
        out.push_str("- Assistant: ");
        out.push_str(&turn.output);
        out.push('\n');
    }
    out
}

fn push_section(out: &mut String, body: &str) {
    let body = body.trim();
    if !body.is_empty() {
        out.push_str(body);
        out.push('\n');
    }
}
