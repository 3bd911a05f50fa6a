//! Per-call prompt assembly for persona agents.
//!
//! A request is built from three parts:
//! 1. the agent's system prompt template, rendered against the scene analysis
//! 2. the recent conversation history, trimmed to the model's token budget
//! 3. an optional prior reply (previous agent or stage), capped in characters
//!
//! The model's context window bounds both the prior excerpt and the reply
//! length through [`TokenBudget`].
//!
//! The prior reply is appended to the system prompt inside a `<prior_reply>`
//! tag so the model can tell it apart from the persona instructions.

use chorus_types::agent::AgentDefinition;
use chorus_types::analysis::AnalysisResult;
use chorus_types::conversation::{ConversationMessage, MessageAuthor};
use chorus_types::llm::{CompletionRequest, Message};
use chorus_types::plan::AgentLimits;

use super::registry::ResolvedAgent;
use crate::llm::token_budget::TokenBudget;

/// Output of an earlier agent handed to the next one.
#[derive(Debug, Clone, Copy)]
pub struct PriorReply<'a> {
    pub author: &'a str,
    pub content: &'a str,
}

/// First `max` characters of `text` (not bytes).
pub fn cap_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Fill the template placeholders of an agent's system prompt.
pub fn render_system_prompt(
    agent: &AgentDefinition,
    analysis: &AnalysisResult,
    max_chars: usize,
) -> String {
    let topics = if analysis.topics.is_empty() {
        "none".to_string()
    } else {
        analysis.topics.join(", ")
    };
    let mut rendered = agent
        .system_prompt
        .replace("{name}", &agent.display_name)
        .replace("{scene}", &analysis.scene_type.to_string())
        .replace("{emotion}", &analysis.emotion.primary.to_string())
        .replace("{topics}", &topics)
        .replace("{max_chars}", &max_chars.to_string());

    if !agent.system_prompt.contains("{max_chars}") {
        rendered.push_str(&format!(
            "\n\nKeep your reply under {max_chars} characters."
        ));
    }
    rendered
}

/// Convert the newest `window` stored messages into chat messages.
///
/// Agent replies are attributed so each persona can see who said what.
pub fn history_messages(history: &[ConversationMessage], window: usize) -> Vec<Message> {
    let start = history.len().saturating_sub(window);
    history[start..]
        .iter()
        .map(|m| match m.role {
            MessageAuthor::User => Message::user(m.content.clone()),
            MessageAuthor::Agent => {
                let author = m.agent_id.as_deref().unwrap_or("agent");
                Message::assistant(format!("[{author}] {}", m.content))
            }
        })
        .collect()
}

/// Build the streaming request for one agent call.
pub fn build_request(
    agent: &ResolvedAgent,
    analysis: &AnalysisResult,
    history: &[Message],
    user_text: &str,
    prior: Option<PriorReply<'_>>,
    limits: AgentLimits,
    prior_output_chars: usize,
) -> CompletionRequest {
    let budget = TokenBudget::for_binding(&agent.binding);
    let mut system = render_system_prompt(&agent.definition, analysis, limits.max_chars);
    if let Some(prior) = prior {
        let excerpt = cap_chars(prior.content, budget.prior_chars(prior_output_chars));
        if !excerpt.is_empty() {
            system.push_str(&format!(
                "\n\n<prior_reply from=\"{}\">\n{}\n</prior_reply>",
                prior.author, excerpt
            ));
        }
    }

    let mut messages = budget.trim_history(history);
    messages.push(Message::user(user_text));

    CompletionRequest {
        model: agent.binding.model.clone(),
        messages,
        system: Some(system),
        max_tokens: budget.reply_tokens(limits.max_tokens),
        temperature: Some(agent.definition.temperature),
        stream: true,
        stop_sequences: None,
    }
}
