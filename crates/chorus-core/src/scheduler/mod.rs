//! Execution planning.
//!
//! The `Scheduler` turns a scene analysis and the agent registry into an
//! [`ExecutionPlan`] for one of four conversation modes, and decides after
//! each stage whether a smart-mode run should continue, branch to a fallback
//! agent, or stop. It is pure: no I/O, no global randomness (natural order
//! comes from the seed carried on the plan).

pub mod planner;

use std::collections::BTreeMap;

use thiserror::Error;

use chorus_types::agent::AgentDefinition;
use chorus_types::analysis::AnalysisResult;
use chorus_types::config::{ModePrecedence, SchedulerConfig};
use chorus_types::conversation::ConversationMode;
use chorus_types::plan::{
    AgentLimits, AggregatedOutcome, AggregationStrategy, ExecutionMode, ExecutionPlan, Flow, Stage,
};

use crate::agent::registry::{AgentRegistry, ModelCatalog};

pub use planner::seeded_shuffle;
use planner::StageDraft;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlanningError {
    #[error("no enabled agents")]
    NoEnabledAgents,
}

/// What to do after a stage finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageDecision {
    Continue,
    /// Insert a single-agent fallback stage for this agent next.
    Branch(String),
    Stop,
}

/// Everything one plan is built from.
#[derive(Debug, Clone, Copy)]
pub struct PlanInput<'a> {
    pub analysis: &'a AnalysisResult,
    pub registry: &'a AgentRegistry,
    pub mode: ConversationMode,
    /// Flow for fixed mode, if one is configured.
    pub flow: Option<&'a Flow>,
    /// Conversation participants; empty means everyone enabled.
    pub participants: &'a [String],
    pub seed: u64,
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    config: SchedulerConfig,
    models: ModelCatalog,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, models: ModelCatalog) -> Self {
        Self { config, models }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Pick the run's mode from the caller's hint and the conversation's mode.
    pub fn resolve_mode(
        &self,
        hint: Option<ConversationMode>,
        conversation: ConversationMode,
    ) -> ConversationMode {
        match self.config.mode_precedence {
            ModePrecedence::HintFirst => hint.unwrap_or(conversation),
            ModePrecedence::ConversationFirst => conversation,
        }
    }

    /// Build a plan. Never returns a plan with an empty stage.
    pub fn plan(&self, input: PlanInput<'_>) -> Result<ExecutionPlan, PlanningError> {
        let registry = input.registry;
        if registry.enabled().next().is_none() {
            return Err(PlanningError::NoEnabledAgents);
        }

        let drafts = match input.mode {
            ConversationMode::Fixed => {
                let stages = planner::fixed(input.flow, registry);
                if stages.is_empty() {
                    tracing::debug!("no usable flow; planning all enabled agents");
                    planner::all_enabled(registry)
                } else {
                    stages
                }
            }
            ConversationMode::Dynamic => planner::dynamic(self.candidates(&input)),
            ConversationMode::Smart => planner::smart(self.candidates(&input)),
            ConversationMode::Natural => {
                planner::natural(input.participants, registry, input.seed)
            }
        };

        let drafts = if drafts.is_empty() {
            tracing::debug!(mode = %input.mode, "no eligible agents; falling back to first enabled");
            planner::minimal(registry)
        } else {
            drafts
        };

        let stages: Vec<Stage> = drafts
            .into_iter()
            .filter(|d| !d.agents.is_empty())
            .map(|d| self.stage_from(d, registry))
            .collect();
        if stages.is_empty() {
            return Err(PlanningError::NoEnabledAgents);
        }

        Ok(ExecutionPlan {
            mode: input.mode,
            seed: input.seed,
            stages,
        })
    }

    /// Decide how to proceed after stage `stage_index` of `plan`.
    ///
    /// Only smart plans ever branch or stop early; every other mode always
    /// continues. `cumulative_quality` is the mean quality of every stage
    /// that produced a reply so far, this one included. `budget_remaining`
    /// is the unspent fraction of the budget.
    pub fn review(
        &self,
        plan: &ExecutionPlan,
        stage_index: usize,
        outcome: &AggregatedOutcome,
        cumulative_quality: f64,
        budget_remaining: f64,
        registry: &AgentRegistry,
    ) -> StageDecision {
        if plan.mode != ConversationMode::Smart {
            return StageDecision::Continue;
        }
        if !outcome.failed && cumulative_quality >= self.config.smart_stop_quality {
            tracing::debug!(stage_index, cumulative_quality, "smart plan reached target quality");
            return StageDecision::Stop;
        }
        if budget_remaining < self.config.smart_min_budget_fraction {
            tracing::debug!(stage_index, budget_remaining, "smart plan low on budget");
            return StageDecision::Stop;
        }
        if outcome.failed {
            let used = plan.agent_ids();
            if let Some(agent) = registry.enabled().find(|a| !used.contains(&a.role)) {
                return StageDecision::Branch(agent.role.clone());
            }
        }
        StageDecision::Continue
    }

    /// Single-agent stage inserted when a smart plan branches.
    pub fn branch_stage(&self, agent_id: &str, registry: &AgentRegistry) -> Stage {
        self.stage_from(
            StageDraft {
                name: format!("{agent_id}_fallback"),
                execution: ExecutionMode::Sequential,
                agents: vec![agent_id.to_string()],
                strategy: AggregationStrategy::FirstSuccess,
                required_markers: Vec::new(),
            },
            registry,
        )
    }

    fn candidates(&self, input: &PlanInput<'_>) -> Vec<String> {
        planner::candidates(
            input.analysis,
            input.registry,
            self.config.recommendation_source,
            self.config.max_dynamic_agents,
        )
    }

    fn stage_from(&self, draft: StageDraft, registry: &AgentRegistry) -> Stage {
        let limits: BTreeMap<String, AgentLimits> = draft
            .agents
            .iter()
            .filter_map(|id| registry.get(id).map(|a| (id.clone(), self.limits_for(a))))
            .collect();
        Stage {
            name: draft.name,
            execution: draft.execution,
            agents: draft.agents,
            limits,
            strategy: draft.strategy,
            required_markers: draft.required_markers,
        }
    }

    /// Agent's token cap, clamped by its model's output limit.
    pub fn limits_for(&self, agent: &AgentDefinition) -> AgentLimits {
        let max_tokens = match self.models.get(&agent.model) {
            Some(binding) => agent.max_tokens.min(binding.capabilities.max_output_tokens),
            None => agent.max_tokens,
        };
        AgentLimits {
            max_chars: self.config.default_max_chars,
            max_tokens,
        }
    }
}
