//! `chorus chat`: run one orchestration and render its events live.
//!
//! Chunks are printed raw as they stream. When chunks from parallel agents
//! interleave, a header is printed each time the speaking agent changes.
//! Ctrl+C cancels the run; work already persisted stays.

use std::collections::HashMap;
use std::io::Write;

use anyhow::{Result, bail};
use console::style;
use futures_util::StreamExt;
use uuid::Uuid;

use chorus_core::orchestrator::{OrchestratorError, RunRequest, RunStatus};
use chorus_core::repository::AgentRepository;
use chorus_types::conversation::ConversationMode;
use chorus_types::event::{EventEnvelope, OrchestrationEvent};

use crate::state::AppState;

/// Options for one `chorus chat` invocation.
pub struct ChatOptions {
    pub text: String,
    pub conversation: Option<Uuid>,
    pub mode: Option<ConversationMode>,
    pub seed: Option<u64>,
    pub budget: Option<f64>,
    pub json: bool,
}

impl ChatOptions {
    fn into_request(self) -> RunRequest {
        let mut request = RunRequest::new(
            self.conversation.unwrap_or_else(Uuid::now_v7),
            self.text,
        );
        if let Some(mode) = self.mode {
            request = request.with_mode(mode);
        }
        if let Some(seed) = self.seed {
            request = request.with_seed(seed);
        }
        if let Some(budget) = self.budget {
            request = request.with_budget(budget);
        }
        request
    }
}

pub async fn chat(state: &AppState, options: ChatOptions) -> Result<()> {
    let json = options.json;
    let names: HashMap<String, String> = state
        .agents
        .list_agents(false)
        .await?
        .into_iter()
        .map(|a| (a.role, a.display_name))
        .collect();

    let mut handle = state.orchestrator.run(options.into_request());
    let mut events = std::pin::pin!(handle.events());
    let mut renderer = EventRenderer::new(names);

    if !json {
        println!();
        println!(
            "  {} conversation {}",
            style("◆").cyan().bold(),
            style(handle.conversation_id()).dim()
        );
    }

    loop {
        tokio::select! {
            next = events.next() => {
                let Some(envelope) = next else { break };
                if json {
                    println!("{}", serde_json::to_string(&envelope)?);
                } else {
                    renderer.render(&envelope);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received, cancelling run");
                handle.cancel();
            }
        }
    }

    match handle.join().await {
        Ok(output) => {
            if !json {
                renderer.finish();
                if output.status == RunStatus::Cancelled {
                    println!("  {}", style("cancelled").yellow());
                }
                println!(
                    "  {} {} stage(s) · cost {:.4} · {}ms",
                    style("|").dim(),
                    output.replies.len(),
                    output.total_cost,
                    output.duration_ms
                );
                println!();
            }
            Ok(())
        }
        Err(OrchestratorError::Failed { reason, partial }) => {
            if !json {
                renderer.finish();
            }
            bail!(
                "run failed: {reason} ({} stage(s) completed, cost {:.4})",
                partial.replies.len(),
                partial.total_cost
            )
        }
        Err(e) => Err(e.into()),
    }
}

/// Styled terminal output for an event stream.
struct EventRenderer {
    names: HashMap<String, String>,
    speaking: Option<String>,
    mid_line: bool,
}

impl EventRenderer {
    fn new(names: HashMap<String, String>) -> Self {
        Self {
            names,
            speaking: None,
            mid_line: false,
        }
    }

    fn name<'a>(&'a self, agent_id: &'a str) -> &'a str {
        self.names.get(agent_id).map_or(agent_id, String::as_str)
    }

    fn render(&mut self, envelope: &EventEnvelope) {
        if let OrchestrationEvent::AgentChunk { agent_id, text } = &envelope.event {
            if self.speaking.as_deref() != Some(agent_id.as_str()) {
                self.end_line();
                print!("  {} ", style(format!("{}:", self.name(agent_id))).green().bold());
                self.speaking = Some(agent_id.clone());
            }
            print!("{text}");
            let _ = std::io::stdout().flush();
            self.mid_line = true;
            return;
        }

        if let Some(line) = self.describe(&envelope.event) {
            self.end_line();
            self.speaking = None;
            println!("{line}");
        }
    }

    fn end_line(&mut self) {
        if self.mid_line {
            println!();
            self.mid_line = false;
        }
    }

    fn finish(&mut self) {
        self.end_line();
    }

    /// One status line for a non-chunk event, `None` for events not shown.
    fn describe(&self, event: &OrchestrationEvent) -> Option<String> {
        let line = match event {
            OrchestrationEvent::AnalysisCompleted { analysis } => format!(
                "  {} scene {} · mood {} · confidence {:.2}",
                style("·").dim(),
                style(analysis.scene_type).cyan(),
                analysis.emotion.primary,
                analysis.confidence
            ),
            OrchestrationEvent::PlanReady { mode, stages, .. } => format!(
                "  {} {} plan, {} stage(s)",
                style("·").dim(),
                mode,
                stages.len()
            ),
            OrchestrationEvent::StageStarted { stage_name } => {
                format!("\n  {} {}", style("▸").cyan(), style(stage_name).bold())
            }
            OrchestrationEvent::AgentError { agent_id, error } => format!(
                "  {} {} failed ({}): {}",
                style("✗").red(),
                self.name(agent_id),
                error.kind,
                error.message
            ),
            OrchestrationEvent::StageFailed { stage_name, .. } => format!(
                "  {} every agent in {} failed",
                style("✗").red(),
                stage_name
            ),
            OrchestrationEvent::ConversationFailed { reason } => {
                format!("\n  {} {}", style("run failed:").red().bold(), reason)
            }
            OrchestrationEvent::ConversationCompleted { .. } => {
                format!("\n  {}", style("✓ done").green())
            }
            _ => return None,
        };
        Some(line)
    }
}
