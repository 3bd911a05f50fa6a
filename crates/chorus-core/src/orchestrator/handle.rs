//! Caller-facing request, handle, and result types of a run.

use futures_util::Stream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use chorus_types::conversation::ConversationMode;
use chorus_types::event::{EventEnvelope, FailureReason, RunState, StageSummary};
use chorus_types::llm::Usage;

/// One incoming user message to orchestrate.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub conversation_id: Uuid,
    pub text: String,
    /// Mode requested by the caller; see `SchedulerConfig::mode_precedence`.
    pub mode_hint: Option<ConversationMode>,
    /// Fixed seed for natural and dynamic-random ordering. Random when `None`.
    pub seed: Option<u64>,
    /// Replaces the conversation's cost budget for this run only.
    pub budget_override: Option<f64>,
}

impl RunRequest {
    pub fn new(conversation_id: Uuid, text: impl Into<String>) -> Self {
        Self {
            conversation_id,
            text: text.into(),
            mode_hint: None,
            seed: None,
            budget_override: None,
        }
    }

    pub fn with_mode(mut self, mode: ConversationMode) -> Self {
        self.mode_hint = Some(mode);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_budget(mut self, budget: f64) -> Self {
        self.budget_override = Some(budget);
        self
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Failed(FailureReason),
    Cancelled,
}

/// Final result of a run: one aggregated reply per successful stage.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutput {
    pub run_id: Uuid,
    pub conversation_id: Uuid,
    pub status: RunStatus,
    pub replies: Vec<StageSummary>,
    pub message_ids: Vec<Uuid>,
    pub total_cost: f64,
    pub total_usage: Usage,
    pub duration_ms: u64,
}

/// Errors surfaced by [`RunHandle::join`] and `Orchestrator::run_to_completion`.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The run ended with `conversation_failed`. Work done before the
    /// failure is kept in `partial`.
    #[error("run failed: {reason}")]
    Failed {
        reason: FailureReason,
        partial: Box<RunOutput>,
    },

    /// The run task panicked or was aborted.
    #[error("run task failed: {0}")]
    Task(String),
}

/// Handle onto a spawned run.
///
/// Dropping the handle does not cancel the run; call [`RunHandle::cancel`].
#[derive(Debug)]
pub struct RunHandle {
    pub(crate) run_id: Uuid,
    pub(crate) conversation_id: Uuid,
    pub(crate) events: Option<mpsc::UnboundedReceiver<EventEnvelope>>,
    pub(crate) state: watch::Receiver<RunState>,
    pub(crate) cancel: CancellationToken,
    pub(crate) task: JoinHandle<RunOutput>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    /// The run's ordered event stream. It ends after the terminal event.
    ///
    /// Can be taken once; later calls yield an empty stream.
    pub fn events(&mut self) -> impl Stream<Item = EventEnvelope> + Send + use<> {
        let receiver = self.events.take();
        async_stream::stream! {
            if let Some(mut receiver) = receiver {
                while let Some(envelope) = receiver.recv().await {
                    yield envelope;
                }
            }
        }
    }

    /// Request cancellation. No new provider calls start after this.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this run, for callers that outlive `&self`.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current state of the run's state machine.
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn watch_state(&self) -> watch::Receiver<RunState> {
        self.state.clone()
    }

    /// Wait for the run to finish.
    pub async fn join(self) -> Result<RunOutput, OrchestratorError> {
        let output = self
            .task
            .await
            .map_err(|e| OrchestratorError::Task(e.to_string()))?;
        match output.status {
            RunStatus::Failed(reason) => Err(OrchestratorError::Failed {
                reason,
                partial: Box::new(output),
            }),
            RunStatus::Completed | RunStatus::Cancelled => Ok(output),
        }
    }
}
