//! Execution plans, stage results, and aggregated outcomes.
//!
//! Plans are built fresh for every incoming message and discarded after the
//! run; they are never persisted. Flows are the persisted templates that
//! fixed-mode plans are built from.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conversation::ConversationMode;
use crate::llm::{ErrorKind, LlmError, Usage};

/// How the agents of one stage are run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One at a time; each agent sees the previous agent's output.
    #[default]
    Sequential,
    /// All at once; agents see no siblings.
    Parallel,
    /// One at a time, in an order shuffled from the run seed.
    DynamicRandom,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Sequential => write!(f, "sequential"),
            ExecutionMode::Parallel => write!(f, "parallel"),
            ExecutionMode::DynamicRandom => write!(f, "dynamic_random"),
        }
    }
}

/// How a stage's per-agent outcomes are folded into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    #[default]
    FirstSuccess,
    BestOf,
    MergeConcat,
}

impl fmt::Display for AggregationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregationStrategy::FirstSuccess => write!(f, "first_success"),
            AggregationStrategy::BestOf => write!(f, "best_of"),
            AggregationStrategy::MergeConcat => write!(f, "merge_concat"),
        }
    }
}

impl FromStr for AggregationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "first_success" => Ok(AggregationStrategy::FirstSuccess),
            "best_of" => Ok(AggregationStrategy::BestOf),
            "merge_concat" => Ok(AggregationStrategy::MergeConcat),
            other => Err(format!("invalid aggregation strategy: '{other}'")),
        }
    }
}

/// Output limits applied to one agent within a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentLimits {
    pub max_chars: usize,
    pub max_tokens: u32,
}

/// One step of an execution plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub execution: ExecutionMode,
    /// Candidate agent role tags, in declared order. Never empty.
    pub agents: Vec<String>,
    pub limits: BTreeMap<String, AgentLimits>,
    pub strategy: AggregationStrategy,
    /// Markers best-of scoring expects in a good reply.
    #[serde(default)]
    pub required_markers: Vec<String>,
}

/// Ordered stages built by the scheduler for a single message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub mode: ConversationMode,
    /// Request-scoped seed; natural and dynamic-random ordering derive from it.
    pub seed: u64,
    pub stages: Vec<Stage>,
}

impl ExecutionPlan {
    /// Every agent referenced by the plan, in first-appearance order.
    pub fn agent_ids(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for stage in &self.stages {
            for agent in &stage.agents {
                if !seen.contains(agent) {
                    seen.push(agent.clone());
                }
            }
        }
        seen
    }
}

/// One stage of a persisted flow template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStage {
    pub name: String,
    #[serde(default)]
    pub execution: ExecutionMode,
    pub roles: Vec<String>,
    #[serde(default)]
    pub strategy: AggregationStrategy,
    #[serde(default)]
    pub required_markers: Vec<String>,
}

/// A named, ordered list of stages used by fixed-mode plans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub name: String,
    /// The conversation mode this flow is looked up by.
    pub mode: ConversationMode,
    pub stages: Vec<FlowStage>,
}

/// Serializable description of a per-agent failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&LlmError> for AgentErrorInfo {
    fn from(err: &LlmError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one agent call within a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub agent_id: String,
    pub success: bool,
    pub latency_ms: u64,
    pub content: Option<String>,
    pub error: Option<AgentErrorInfo>,
    /// Persisted message id, for successful outcomes.
    pub message_id: Option<Uuid>,
    pub usage: Usage,
    pub cost: f64,
}

impl AgentOutcome {
    pub fn failed(agent_id: impl Into<String>, error: AgentErrorInfo, latency_ms: u64) -> Self {
        Self {
            agent_id: agent_id.into(),
            success: false,
            latency_ms,
            content: None,
            error: Some(error),
            message_id: None,
            usage: Usage::default(),
            cost: 0.0,
        }
    }
}

/// The folded result of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedOutcome {
    /// Selected or merged content; `None` when every agent failed.
    pub content: Option<String>,
    pub selected_agent: Option<String>,
    pub contributors: Vec<String>,
    /// Always within `[0, 1]`.
    pub quality: f64,
    pub strategy: AggregationStrategy,
    pub latency_ms: u64,
    pub failed: bool,
}

impl AggregatedOutcome {
    /// Sentinel for a stage in which every agent failed.
    pub fn failed(strategy: AggregationStrategy, latency_ms: u64) -> Self {
        Self {
            content: None,
            selected_agent: None,
            contributors: Vec::new(),
            quality: 0.0,
            strategy,
            latency_ms,
            failed: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(name: &str, agents: &[&str]) -> Stage {
        Stage {
            name: name.into(),
            execution: ExecutionMode::Sequential,
            agents: agents.iter().map(|a| a.to_string()).collect(),
            limits: BTreeMap::new(),
            strategy: AggregationStrategy::FirstSuccess,
            required_markers: vec![],
        }
    }

    #[test]
    fn test_plan_agent_ids_dedupes_in_order() {
        let plan = ExecutionPlan {
            mode: ConversationMode::Fixed,
            seed: 7,
            stages: vec![stage("a", &["empathy", "practical"]), stage("b", &["empathy", "humor"])],
        };
        assert_eq!(plan.agent_ids(), vec!["empathy", "practical", "humor"]);
    }

    #[test]
    fn test_strategy_parse_accepts_dashes() {
        assert_eq!(
            "merge-concat".parse::<AggregationStrategy>().unwrap(),
            AggregationStrategy::MergeConcat
        );
        assert_eq!(
            "best_of".parse::<AggregationStrategy>().unwrap(),
            AggregationStrategy::BestOf
        );
    }

    #[test]
    fn test_failed_sentinel() {
        let outcome = AggregatedOutcome::failed(AggregationStrategy::BestOf, 12);
        assert!(outcome.failed);
        assert!(outcome.content.is_none());
        assert_eq!(outcome.quality, 0.0);
    }

    #[test]
    fn test_flow_stage_defaults_from_toml() {
        let flow: Flow = toml::from_str(
            r#"
name = "support"
mode = "fixed"

[[stages]]
name = "listen"
roles = ["empathy"]

[[stages]]
name = "advise"
execution = "parallel"
roles = ["practical", "encouragement"]
strategy = "best_of"
"#,
        )
        .unwrap();
        assert_eq!(flow.stages.len(), 2);
        assert_eq!(flow.stages[0].execution, ExecutionMode::Sequential);
        assert_eq!(flow.stages[1].strategy, AggregationStrategy::BestOf);
    }
}
