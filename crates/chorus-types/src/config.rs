//! Configuration types for Chorus.
//!
//! `ChorusConfig` represents the top-level `chorus.toml`. Every field has a
//! serde default, so an empty file is a valid configuration. The resolved
//! [`OrchestratorConfig`] is cloned into each run; nothing reads a global.

use serde::{Deserialize, Serialize};

use crate::agent::AgentDefinition;
use crate::conversation::ConversationMode;
use crate::llm::{ModelBinding, ProviderConfig};
use crate::plan::Flow;

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChorusConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    #[serde(default)]
    pub models: Vec<ModelBinding>,

    /// Agents seeded into persistence when absent.
    #[serde(default)]
    pub agents: Vec<AgentDefinition>,

    /// Flows seeded into persistence when absent.
    #[serde(default)]
    pub flows: Vec<Flow>,
}

/// Settings threaded through a single orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Cost budget for conversations created without one.
    #[serde(default = "default_budget")]
    pub default_budget: f64,

    #[serde(default)]
    pub default_mode: ConversationMode,

    /// Per provider call, never global.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Retries for transient errors before any chunk was forwarded.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Number of most recent messages offered to each agent.
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    /// Cap on prior agent/stage output injected as extra context.
    #[serde(default = "default_prior_output_chars")]
    pub prior_output_chars: usize,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

fn default_budget() -> f64 {
    1.0
}

fn default_call_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    1
}

fn default_history_window() -> usize {
    20
}

fn default_prior_output_chars() -> usize {
    120
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_budget: default_budget(),
            default_mode: ConversationMode::default(),
            call_timeout_secs: default_call_timeout_secs(),
            max_retries: default_max_retries(),
            history_window: default_history_window(),
            prior_output_chars: default_prior_output_chars(),
            analysis: AnalysisConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Scene analyzer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Use the model path; when false only keyword matching runs.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Model binding id used for analysis calls.
    #[serde(default)]
    pub model: Option<String>,

    /// Model results below this confidence fall back to keywords.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Age after which a cache hit also schedules a background refresh.
    #[serde(default = "default_refresh_after_secs")]
    pub refresh_after_secs: u64,

    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    #[serde(default = "default_analysis_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_min_confidence() -> f64 {
    0.5
}

fn default_cache_ttl_secs() -> u64 {
    30 * 60
}

fn default_refresh_after_secs() -> u64 {
    20 * 60
}

fn default_cache_capacity() -> usize {
    1_000
}

fn default_analysis_timeout_secs() -> u64 {
    15
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: None,
            min_confidence: default_min_confidence(),
            cache_ttl_secs: default_cache_ttl_secs(),
            refresh_after_secs: default_refresh_after_secs(),
            cache_capacity: default_cache_capacity(),
            timeout_secs: default_analysis_timeout_secs(),
        }
    }
}

/// Whether the caller's mode hint or the conversation's mode wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModePrecedence {
    #[default]
    HintFirst,
    ConversationFirst,
}

/// Where dynamic and smart plans take their candidate agents from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationSource {
    /// Only the analyzer's recommendations.
    Analysis,
    /// Only agents whose capabilities match the scene or topics.
    Capabilities,
    /// Analyzer recommendations, then capability matches as fill.
    #[default]
    AnalysisThenCapabilities,
}

/// Scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_dynamic_agents")]
    pub max_dynamic_agents: usize,

    #[serde(default = "default_max_chars")]
    pub default_max_chars: usize,

    /// Smart mode stops once the mean quality of its replies reaches this.
    #[serde(default = "default_smart_stop_quality")]
    pub smart_stop_quality: f64,

    /// Smart mode stops once less than this fraction of the budget remains.
    #[serde(default = "default_smart_min_budget_fraction")]
    pub smart_min_budget_fraction: f64,

    #[serde(default)]
    pub mode_precedence: ModePrecedence,

    #[serde(default)]
    pub recommendation_source: RecommendationSource,
}

fn default_max_dynamic_agents() -> usize {
    3
}

fn default_max_chars() -> usize {
    300
}

fn default_smart_stop_quality() -> f64 {
    0.85
}

fn default_smart_min_budget_fraction() -> f64 {
    0.2
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_dynamic_agents: default_max_dynamic_agents(),
            default_max_chars: default_max_chars(),
            smart_stop_quality: default_smart_stop_quality(),
            smart_min_budget_fraction: default_smart_min_budget_fraction(),
            mode_precedence: ModePrecedence::default(),
            recommendation_source: RecommendationSource::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default_values() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.call_timeout_secs, 60);
        assert_eq!(config.prior_output_chars, 120);
        assert_eq!(config.analysis.cache_ttl_secs, 1800);
        assert_eq!(config.scheduler.max_dynamic_agents, 3);
        assert_eq!(config.scheduler.mode_precedence, ModePrecedence::HintFirst);
    }

    #[test]
    fn test_config_deserialize_empty() {
        let config: ChorusConfig = toml::from_str("").unwrap();
        assert!(config.providers.is_empty());
        assert!(config.agents.is_empty());
        assert_eq!(config.orchestrator.max_retries, 1);
    }

    #[test]
    fn test_config_deserialize_with_values() {
        let toml_str = r#"
[orchestrator]
default_budget = 100.0
default_mode = "natural"
call_timeout_secs = 5

[orchestrator.analysis]
enabled = false
min_confidence = 0.6

[orchestrator.scheduler]
max_dynamic_agents = 2
recommendation_source = "capabilities"

[[providers]]
name = "openai"
provider_type = "openai_compatible"
api_key_env = "OPENAI_API_KEY"

[[models]]
id = "fast"
provider = "openai"
model = "gpt-4o-mini"
context_length = 128000

[models.pricing]
input_cost_per_million = 0.15
output_cost_per_million = 0.6

[[agents]]
role = "empathy"
display_name = "Empathy"
system_prompt = "You are {name}."
model = "fast"
priority = 1
"#;
        let config: ChorusConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.orchestrator.default_budget, 100.0);
        assert_eq!(config.orchestrator.default_mode, ConversationMode::Natural);
        assert!(!config.orchestrator.analysis.enabled);
        assert_eq!(config.orchestrator.analysis.cache_ttl_secs, 1800);
        assert_eq!(config.orchestrator.scheduler.max_dynamic_agents, 2);
        assert_eq!(
            config.orchestrator.scheduler.recommendation_source,
            RecommendationSource::Capabilities
        );
        assert_eq!(config.providers[0].api_key_env.as_deref(), Some("OPENAI_API_KEY"));
        assert!(config.providers[0].enabled);
        assert_eq!(config.models[0].context_length, 128_000);
        assert!((config.models[0].pricing.output_cost_per_million - 0.6).abs() < f64::EPSILON);
        assert_eq!(config.agents[0].priority, 1);
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = ChorusConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ChorusConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.orchestrator.history_window, 20);
    }
}
