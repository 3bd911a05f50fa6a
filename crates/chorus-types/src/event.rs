//! Lifecycle events for a single orchestration run.
//!
//! `OrchestrationEvent` is the ordered stream the calling layer consumes.
//! All variants are Clone + Send + Sync and serialize with a `type` tag so
//! they can be forwarded verbatim over SSE or as JSON lines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analysis::AnalysisResult;
use crate::conversation::ConversationMode;
use crate::llm::Usage;
use crate::plan::{AgentErrorInfo, AggregatedOutcome};

/// Why a run ended in failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    BudgetExceeded,
    PlanningFailed,
    AllStagesFailed,
    Internal,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::BudgetExceeded => write!(f, "budget_exceeded"),
            FailureReason::PlanningFailed => write!(f, "planning_failed"),
            FailureReason::AllStagesFailed => write!(f, "all_stages_failed"),
            FailureReason::Internal => write!(f, "internal"),
        }
    }
}

/// Short description of a stage, as announced in `plan_ready`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOverview {
    pub name: String,
    pub agents: Vec<String>,
}

/// Final aggregated reply of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage_name: String,
    pub outcome: AggregatedOutcome,
}

/// Totals reported with `conversation_completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub conversation_id: Uuid,
    pub stages: Vec<StageSummary>,
    /// Ids of every agent message persisted during the run.
    pub message_ids: Vec<Uuid>,
    pub total_cost: f64,
    pub total_usage: Usage,
    pub duration_ms: u64,
}

/// Events emitted during one orchestration run, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    /// The scene analyzer has started on the incoming message.
    AnalysisStarted,

    /// Scene analysis finished (possibly via fallback).
    AnalysisCompleted { analysis: AnalysisResult },

    /// The scheduler produced a plan.
    PlanReady {
        mode: ConversationMode,
        seed: u64,
        stages: Vec<StageOverview>,
    },

    StageStarted { stage_name: String },

    AgentStarted { agent_id: String },

    /// A chunk of streamed text, forwarded as soon as it arrives.
    AgentChunk { agent_id: String, text: String },

    AgentCompleted {
        agent_id: String,
        message_id: Uuid,
        usage: Usage,
    },

    /// A single agent failed; the rest of the stage carries on.
    AgentError {
        agent_id: String,
        error: AgentErrorInfo,
    },

    StageAggregated {
        stage_name: String,
        outcome: AggregatedOutcome,
    },

    /// Every agent in the stage failed.
    StageFailed {
        stage_name: String,
        errors: Vec<AgentErrorInfo>,
    },

    ConversationCompleted { summary: RunSummary },

    ConversationFailed { reason: FailureReason },

    ConversationCancelled,
}

impl OrchestrationEvent {
    /// Extract the agent id if this event is agent-scoped.
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            OrchestrationEvent::AgentStarted { agent_id }
            | OrchestrationEvent::AgentChunk { agent_id, .. }
            | OrchestrationEvent::AgentCompleted { agent_id, .. }
            | OrchestrationEvent::AgentError { agent_id, .. } => Some(agent_id),
            _ => None,
        }
    }

    /// Whether this event ends the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationEvent::ConversationCompleted { .. }
                | OrchestrationEvent::ConversationFailed { .. }
                | OrchestrationEvent::ConversationCancelled
        )
    }

    /// The `type` tag this event serializes with.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestrationEvent::AnalysisStarted => "analysis_started",
            OrchestrationEvent::AnalysisCompleted { .. } => "analysis_completed",
            OrchestrationEvent::PlanReady { .. } => "plan_ready",
            OrchestrationEvent::StageStarted { .. } => "stage_started",
            OrchestrationEvent::AgentStarted { .. } => "agent_started",
            OrchestrationEvent::AgentChunk { .. } => "agent_chunk",
            OrchestrationEvent::AgentCompleted { .. } => "agent_completed",
            OrchestrationEvent::AgentError { .. } => "agent_error",
            OrchestrationEvent::StageAggregated { .. } => "stage_aggregated",
            OrchestrationEvent::StageFailed { .. } => "stage_failed",
            OrchestrationEvent::ConversationCompleted { .. } => "conversation_completed",
            OrchestrationEvent::ConversationFailed { .. } => "conversation_failed",
            OrchestrationEvent::ConversationCancelled => "conversation_cancelled",
        }
    }
}

/// An event stamped with its position in the run's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub run_id: Uuid,
    pub conversation_id: Uuid,
    /// Strictly increasing within a run, starting at 0.
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: OrchestrationEvent,
}

/// States of the orchestration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Analyzing,
    Planning,
    ExecutingStage(usize),
    Aggregating(usize),
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed | RunState::Cancelled)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        if self.is_terminal() {
            return false;
        }
        match (*self, next) {
            (_, Failed) | (_, Cancelled) => true,
            (Idle, Analyzing) => true,
            (Analyzing, Planning) => true,
            (Planning, ExecutingStage(0)) => true,
            (Planning, Completed) => true,
            (ExecutingStage(i), Aggregating(j)) => i == j,
            (Aggregating(i), ExecutingStage(j)) => j == i + 1,
            (Aggregating(_), Completed) => true,
            _ => false,
        }
    }
}
