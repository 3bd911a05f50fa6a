//! Persona agent definitions.

use serde::{Deserialize, Serialize};

/// Configuration for a single persona agent.
///
/// The `role` tag is unique across the registry and doubles as the agent id
/// in events, messages, and plans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub role: String,
    pub display_name: String,
    /// Template rendered per call; supports `{name}`, `{scene}`, `{emotion}`,
    /// `{topics}` and `{max_chars}` placeholders.
    pub system_prompt: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Reference to a `ModelBinding` id.
    pub model: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Lower runs first.
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Declared order, used to break priority ties.
    #[serde(default)]
    pub order: u32,
    /// Scene types and topics this agent is suited to.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    512
}

fn default_enabled() -> bool {
    true
}

fn default_priority() -> u32 {
    100
}

impl AgentDefinition {
    /// Sort key used everywhere agents are ordered: priority, then declared order.
    pub fn rank(&self) -> (u32, u32) {
        (self.priority, self.order)
    }

    /// Whether any capability tag matches the given label (case-insensitive).
    pub fn has_capability(&self, label: &str) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.eq_ignore_ascii_case(label))
    }
}
