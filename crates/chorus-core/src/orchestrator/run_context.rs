//! State shared by every agent call of one run.
//!
//! Built once after planning and handed to parallel tasks behind an `Arc`.
//! Everything in here is either immutable for the run or internally
//! synchronized (`CostBudget`, `EventEmitter`, `CancellationToken`).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use chorus_types::analysis::AnalysisResult;
use chorus_types::config::OrchestratorConfig;
use chorus_types::event::RunState;
use chorus_types::llm::Message;

use super::budget::CostBudget;
use crate::agent::prompt::PriorReply;
use crate::agent::registry::{RegistryError, ResolvedAgent};
use crate::event::EventEmitter;

pub(crate) struct RunContext<C> {
    pub conversation_id: Uuid,
    pub conversations: Arc<C>,
    pub emitter: EventEmitter,
    pub cancel: CancellationToken,
    pub budget: CostBudget,
    pub config: OrchestratorConfig,
    pub analysis: AnalysisResult,
    pub history: Vec<Message>,
    pub user_text: String,
    /// Every enabled agent, bound to its model. Failed bindings surface as
    /// `agent_error` when the agent is called.
    pub agents: HashMap<String, Result<ResolvedAgent, RegistryError>>,
}

/// Owned output of an earlier agent or stage, passed to the next call.
#[derive(Debug, Clone)]
pub(crate) struct Prior {
    pub author: String,
    pub content: String,
}

impl Prior {
    pub fn as_reply(&self) -> PriorReply<'_> {
        PriorReply {
            author: &self.author,
            content: &self.content,
        }
    }
}

/// Publishes run state transitions and rejects illegal ones.
pub(crate) struct StateTracker {
    sender: watch::Sender<RunState>,
}

impl StateTracker {
    pub fn new() -> (Self, watch::Receiver<RunState>) {
        let (sender, receiver) = watch::channel(RunState::Idle);
        (Self { sender }, receiver)
    }

    pub fn current(&self) -> RunState {
        *self.sender.borrow()
    }

    pub fn advance(&self, next: RunState) {
        let current = self.current();
        if !current.can_transition_to(next) {
            tracing::warn!(from = ?current, to = ?next, "ignoring illegal run state transition");
            return;
        }
        tracing::info!(from = ?current, to = ?next, "run state");
        self.sender.send_replace(next);
    }
}
