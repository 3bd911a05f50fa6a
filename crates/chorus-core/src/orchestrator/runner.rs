//! Stage and agent execution.
//!
//! Sequential and dynamic-random stages await one call at a time and hand
//! each agent the previous reply. Parallel stages spawn every call on a
//! `JoinSet` and re-sort results into declared order. Each call checks
//! cancellation and the budget before it starts, races the cancellation
//! token while streaming, and is bounded by the per-call timeout.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::task::JoinSet;
use tokio::time::Instant;

use chorus_types::conversation::{MessageAuthor, NewMessage};
use chorus_types::event::OrchestrationEvent;
use chorus_types::llm::{CompletionRequest, LlmError, StreamEvent, Usage};
use chorus_types::plan::{AgentErrorInfo, AgentLimits, AgentOutcome, ExecutionMode, Stage};

use super::budget::BudgetStatus;
use super::run_context::{Prior, RunContext};
use crate::agent::prompt::build_request;
use crate::agent::registry::ResolvedAgent;
use crate::llm::{estimate_cost, estimate_request_tokens, estimate_usage};
use crate::repository::ConversationRepository;
use crate::scheduler::seeded_shuffle;

/// Why a stage stopped before calling all of its agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Halt {
    Cancelled,
    BudgetExceeded,
}

impl Halt {
    /// Cancellation wins when parallel calls halt for different reasons.
    fn merge(self, other: Option<Halt>) -> Halt {
        match (self, other) {
            (Halt::Cancelled, _) | (_, Some(Halt::Cancelled)) => Halt::Cancelled,
            _ => Halt::BudgetExceeded,
        }
    }
}

pub(crate) enum CallResult {
    Done(AgentOutcome),
    Halted(Halt),
}

/// Outcomes of the agents that ran, in declared (or shuffled) order.
pub(crate) struct StageRun {
    pub outcomes: Vec<AgentOutcome>,
    pub halt: Option<Halt>,
}

struct StreamedReply {
    content: String,
    usage: Option<Usage>,
}

/// Run every agent of `stage` according to its execution mode.
pub(crate) async fn run_stage<C>(
    ctx: &Arc<RunContext<C>>,
    stage: &Stage,
    stage_index: usize,
    seed: u64,
    prior: Option<Prior>,
) -> StageRun
where
    C: ConversationRepository + 'static,
{
    match stage.execution {
        ExecutionMode::Sequential => run_in_order(ctx, stage, &stage.agents, prior).await,
        ExecutionMode::DynamicRandom => {
            let mut order = stage.agents.clone();
            seeded_shuffle(&mut order, seed.wrapping_add(stage_index as u64));
            tracing::debug!(stage = %stage.name, ?order, "shuffled stage order");
            run_in_order(ctx, stage, &order, prior).await
        }
        ExecutionMode::Parallel => run_parallel(ctx, stage, prior).await,
    }
}

async fn run_in_order<C: ConversationRepository>(
    ctx: &RunContext<C>,
    stage: &Stage,
    order: &[String],
    mut prior: Option<Prior>,
) -> StageRun {
    let mut outcomes = Vec::with_capacity(order.len());
    for agent_id in order {
        match call_agent(ctx, stage, agent_id, prior.as_ref()).await {
            CallResult::Done(outcome) => {
                if let (true, Some(content)) = (outcome.success, outcome.content.as_ref()) {
                    prior = Some(Prior {
                        author: agent_id.clone(),
                        content: content.clone(),
                    });
                }
                outcomes.push(outcome);
            }
            CallResult::Halted(halt) => {
                return StageRun {
                    outcomes,
                    halt: Some(halt),
                };
            }
        }
    }
    StageRun {
        outcomes,
        halt: None,
    }
}

async fn run_parallel<C>(ctx: &Arc<RunContext<C>>, stage: &Stage, prior: Option<Prior>) -> StageRun
where
    C: ConversationRepository + 'static,
{
    let mut set = JoinSet::new();
    for (index, agent_id) in stage.agents.iter().enumerate() {
        let ctx = Arc::clone(ctx);
        let stage = stage.clone();
        let agent_id = agent_id.clone();
        let prior = prior.clone();
        set.spawn(async move {
            let result = call_agent(&ctx, &stage, &agent_id, prior.as_ref()).await;
            (index, result)
        });
    }

    let mut slots: Vec<Option<AgentOutcome>> = vec![None; stage.agents.len()];
    let mut halted = vec![false; stage.agents.len()];
    let mut halt: Option<Halt> = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, CallResult::Done(outcome))) => slots[index] = Some(outcome),
            Ok((index, CallResult::Halted(h))) => {
                halted[index] = true;
                halt = Some(h.merge(halt));
            }
            Err(e) => tracing::error!(stage = %stage.name, error = %e, "agent task failed"),
        }
    }

    let outcomes = slots
        .into_iter()
        .zip(halted)
        .zip(&stage.agents)
        .filter_map(|((slot, halted), agent_id)| match slot {
            Some(outcome) => Some(outcome),
            None if halted => None,
            None => {
                let error = LlmError::Unknown("agent task aborted".to_string());
                Some(report_failure(ctx, agent_id, &error, 0))
            }
        })
        .collect();

    StageRun { outcomes, halt }
}

/// Call one agent: budget check, stream with retries, persist, report.
#[tracing::instrument(name = "agent_call", skip_all, fields(agent_id = %agent_id, stage = %stage.name))]
pub(crate) async fn call_agent<C: ConversationRepository>(
    ctx: &RunContext<C>,
    stage: &Stage,
    agent_id: &str,
    prior: Option<&Prior>,
) -> CallResult {
    if ctx.cancel.is_cancelled() {
        return CallResult::Halted(Halt::Cancelled);
    }
    let started = Instant::now();

    let agent = match ctx.agents.get(agent_id) {
        Some(Ok(agent)) => agent,
        Some(Err(e)) => {
            let error = LlmError::Unknown(e.to_string());
            return CallResult::Done(report_failure(ctx, agent_id, &error, 0));
        }
        None => {
            let error = LlmError::Unknown(format!("agent '{agent_id}' is not available"));
            return CallResult::Done(report_failure(ctx, agent_id, &error, 0));
        }
    };

    let limits = stage.limits.get(agent_id).copied().unwrap_or(AgentLimits {
        max_chars: ctx.config.scheduler.default_max_chars,
        max_tokens: agent.definition.max_tokens,
    });
    let request = build_request(
        agent,
        &ctx.analysis,
        &ctx.history,
        &ctx.user_text,
        prior.map(Prior::as_reply),
        limits,
        ctx.config.prior_output_chars,
    );

    let pricing = agent.binding.pricing;
    let input_tokens = match agent.provider.count_tokens(&request).await {
        Ok(count) => count.input_tokens,
        Err(e) => {
            tracing::debug!(error = %e, "token count failed, using the local estimate");
            estimate_request_tokens(&request)
        }
    };
    let worst_case = estimate_cost(
        &Usage {
            input_tokens,
            output_tokens: request.max_tokens,
        },
        &pricing,
    );
    let reservation = match ctx
        .budget
        .try_reserve(ctx.budget.next_call_estimate(worst_case))
    {
        Ok(reservation) => reservation,
        Err(exceeded) => {
            tracing::warn!(
                projected = exceeded.projected,
                limit = exceeded.limit,
                "next call would exceed the budget"
            );
            return CallResult::Halted(Halt::BudgetExceeded);
        }
    };

    ctx.emitter.emit(OrchestrationEvent::AgentStarted {
        agent_id: agent_id.to_string(),
    });

    let call_timeout = Duration::from_secs(ctx.config.call_timeout_secs);
    let mut attempt: u32 = 0;
    let reply = loop {
        if attempt > 0 && ctx.cancel.is_cancelled() {
            ctx.budget.release(reservation);
            return CallResult::Halted(Halt::Cancelled);
        }

        let mut forwarded = false;
        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                ctx.budget.release(reservation);
                return CallResult::Halted(Halt::Cancelled);
            }
            result = tokio::time::timeout(
                call_timeout,
                stream_reply(ctx, agent, request.clone(), &mut forwarded),
            ) => result.unwrap_or(Err(LlmError::Timeout)),
        };

        match result {
            Ok(reply) => break reply,
            Err(e) if e.is_transient() && !forwarded && attempt < ctx.config.max_retries => {
                attempt += 1;
                tracing::debug!(attempt, error = %e, "transient provider error, retrying");
            }
            Err(e) => {
                ctx.budget.release(reservation);
                let latency_ms = started.elapsed().as_millis() as u64;
                return CallResult::Done(report_failure(ctx, agent_id, &e, latency_ms));
            }
        }
    };

    let usage = reply
        .usage
        .unwrap_or_else(|| estimate_usage(&request, &reply.content));
    let cost = estimate_cost(&usage, &pricing);
    match ctx.budget.settle(reservation, cost) {
        BudgetStatus::Warning => tracing::warn!(
            spent = ctx.budget.spent(),
            limit = ctx.budget.limit(),
            "run has used 80% of its budget"
        ),
        BudgetStatus::Exhausted => tracing::warn!(
            spent = ctx.budget.spent(),
            limit = ctx.budget.limit(),
            "run budget exhausted"
        ),
        BudgetStatus::Ok => {}
    }
    let latency_ms = started.elapsed().as_millis() as u64;

    let message = NewMessage {
        conversation_id: ctx.conversation_id,
        role: MessageAuthor::Agent,
        agent_id: Some(agent_id.to_string()),
        stage: Some(stage.name.clone()),
        content: reply.content.clone(),
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cost,
    };
    match ctx.conversations.create_message(message).await {
        Ok(stored) => {
            tracing::debug!(message_id = %stored.id, latency_ms, cost, "agent reply stored");
            ctx.emitter.emit(OrchestrationEvent::AgentCompleted {
                agent_id: agent_id.to_string(),
                message_id: stored.id,
                usage,
            });
            CallResult::Done(AgentOutcome {
                agent_id: agent_id.to_string(),
                success: true,
                latency_ms,
                content: Some(reply.content),
                error: None,
                message_id: Some(stored.id),
                usage,
                cost,
            })
        }
        Err(e) => {
            let error = LlmError::Unknown(format!("failed to store reply: {e}"));
            let mut outcome = report_failure(ctx, agent_id, &error, latency_ms);
            outcome.usage = usage;
            outcome.cost = cost;
            CallResult::Done(outcome)
        }
    }
}

/// Stream one provider call, forwarding every chunk as it arrives.
///
/// `forwarded` is set once the first chunk has gone out, after which the
/// call is no longer retried.
async fn stream_reply<C>(
    ctx: &RunContext<C>,
    agent: &ResolvedAgent,
    request: CompletionRequest,
    forwarded: &mut bool,
) -> Result<StreamedReply, LlmError> {
    let mut stream = agent.provider.stream(request);
    let mut content = String::new();
    let mut usage = None;

    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::TextDelta { text, .. } => {
                if text.is_empty() {
                    continue;
                }
                content.push_str(&text);
                *forwarded = true;
                ctx.emitter.emit(OrchestrationEvent::AgentChunk {
                    agent_id: agent.definition.role.clone(),
                    text,
                });
            }
            StreamEvent::Usage(reported) => usage = Some(reported),
            StreamEvent::Done => break,
            StreamEvent::Connected | StreamEvent::MessageDelta { .. } => {}
        }
    }

    if content.trim().is_empty() {
        return Err(LlmError::MalformedResponse("empty reply".to_string()));
    }
    Ok(StreamedReply { content, usage })
}

fn report_failure<C>(
    ctx: &RunContext<C>,
    agent_id: &str,
    error: &LlmError,
    latency_ms: u64,
) -> AgentOutcome {
    tracing::warn!(agent_id, error = %error, "agent call failed");
    let info = AgentErrorInfo::from(error);
    ctx.emitter.emit(OrchestrationEvent::AgentError {
        agent_id: agent_id.to_string(),
        error: info.clone(),
    });
    AgentOutcome::failed(agent_id, info, latency_ms)
}
