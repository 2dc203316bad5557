//! Prompt construction modules.

pub mod prompt_budget;
pub mod prompt_builder;

pub use prompt_budget::{PromptParts, enforce_budget, shrink_tail};
pub use prompt_builder::{build_prompt_block, render_tail};
