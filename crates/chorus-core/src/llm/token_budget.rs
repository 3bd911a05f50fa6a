//! Token budget management for LLM context windows.
//!
//! Allocates the finite context window of a model binding across the
//! competing parts of an agent prompt: the persona prompt, injected prior
//! output, conversation history, and the reply itself.

use chorus_types::llm::{Message, ModelBinding};

use super::estimate_tokens;

/// Manages the allocation of a model's context window across priorities.
///
/// Budget allocation:
/// - Prior agent / stage output: 5% of context
/// - Conversation history: 60% of context
/// - Reply reserve: 20% of context
///
/// The remaining 15% is left for the persona prompt and the new message.
#[derive(Debug, Clone)]
pub struct TokenBudget {
    pub max_context_tokens: u32,
    pub prior_context_budget: u32,
    pub history_budget: u32,
    pub reply_reserve: u32,
}

impl TokenBudget {
    /// Create a new token budget from a maximum context size.
    pub fn new(max_context: u32) -> Self {
        Self {
            max_context_tokens: max_context,
            prior_context_budget: max_context * 5 / 100,
            history_budget: max_context * 60 / 100,
            reply_reserve: max_context * 20 / 100,
        }
    }

    /// Derive a token budget from a resolved model binding.
    pub fn for_binding(binding: &ModelBinding) -> Self {
        Self::new(binding.context_length)
    }

    /// Character cap for an injected prior reply: the configured cap, or
    /// less when the prior context budget is smaller.
    pub fn prior_chars(&self, configured: usize) -> usize {
        configured.min(self.prior_context_budget as usize * 4)
    }

    /// Clamp a requested reply length to the reply reserve.
    pub fn reply_tokens(&self, requested: u32) -> u32 {
        requested.min(self.reply_reserve.max(1))
    }

    /// Keep the most recent messages that fit in the history budget.
    ///
    /// Order is preserved; older messages are dropped first.
    pub fn trim_history(&self, history: &[Message]) -> Vec<Message> {
        let mut used: u32 = 0;
        let mut kept = Vec::new();
        for msg in history.iter().rev() {
            let cost = estimate_tokens(&msg.content) + 4;
            if used + cost > self.history_budget {
                break;
            }
            used += cost;
            kept.push(msg.clone());
        }
        kept.reverse();
        kept
    }
}
