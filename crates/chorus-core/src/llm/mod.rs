//! Adapter interface over heterogeneous LLM providers.
//!
//! The orchestrator and scheduler only ever talk to [`BoxLlmProvider`]s looked
//! up by name in a [`ProviderRegistry`]; they never branch on which provider
//! sits behind a name.

pub mod box_provider;
pub mod provider;
pub mod registry;
pub mod scripted;
pub mod token_budget;

use chorus_types::llm::{CompletionRequest, ModelPricing, Usage};

/// Estimate tokens from text length (~4 chars per token).
pub fn estimate_tokens(text: &str) -> u32 {
    (text.len() as f64 / 4.0).ceil() as u32
}

/// Estimate the prompt tokens of a request without asking the provider.
pub fn estimate_request_tokens(request: &CompletionRequest) -> u32 {
    let mut total_chars: usize = 0;
    if let Some(ref system) = request.system {
        total_chars += system.len();
    }
    for msg in &request.messages {
        // Overhead for role and message structure
        total_chars += msg.content.len() + 10;
    }
    (total_chars as f64 / 4.0).ceil() as u32
}

/// Usage to charge when a provider reported none.
pub fn estimate_usage(request: &CompletionRequest, response: &str) -> Usage {
    Usage {
        input_tokens: estimate_request_tokens(request),
        output_tokens: estimate_tokens(response),
    }
}

/// Cost in cost units of `usage` under `pricing`.
pub fn estimate_cost(usage: &Usage, pricing: &ModelPricing) -> f64 {
    pricing.cost_of(usage)
}
