//! Per-stage result aggregation.
//!
//! [`aggregate`] is a pure function of the stage's outcomes and an
//! [`AggregationContext`]: calling it twice on the same inputs yields the
//! same [`AggregatedOutcome`]. When no agent succeeded it returns the
//! failure sentinel from [`AggregatedOutcome::failed`].

pub mod scoring;

use std::collections::{BTreeMap, HashMap};

use chorus_types::plan::{
    AgentErrorInfo, AgentLimits, AgentOutcome, AggregatedOutcome, AggregationStrategy,
};

/// Inputs besides the outcomes themselves.
#[derive(Debug, Clone, Default)]
pub struct AggregationContext {
    /// Content of the previous stage, for novelty scoring.
    pub prior_content: Option<String>,
    pub limits: BTreeMap<String, AgentLimits>,
    /// Used for agents without an entry in `limits`.
    pub default_max_chars: usize,
    pub required_markers: Vec<String>,
    /// Role tag to display name, for merge-concat attribution.
    pub display_names: HashMap<String, String>,
}

impl AggregationContext {
    fn max_chars(&self, agent_id: &str) -> usize {
        self.limits
            .get(agent_id)
            .map_or(self.default_max_chars, |l| l.max_chars)
    }

    fn display_name<'a>(&'a self, agent_id: &'a str) -> &'a str {
        self.display_names
            .get(agent_id)
            .map_or(agent_id, String::as_str)
    }

    fn score(&self, agent_id: &str, content: &str) -> f64 {
        scoring::score(
            content,
            self.max_chars(agent_id),
            self.prior_content.as_deref(),
            &self.required_markers,
        )
    }
}

/// Combine a stage's outcomes (in declared order) under `strategy`.
pub fn aggregate(
    results: &[AgentOutcome],
    strategy: AggregationStrategy,
    context: &AggregationContext,
) -> AggregatedOutcome {
    let latency_ms = results.iter().map(|r| r.latency_ms).max().unwrap_or(0);
    let successes: Vec<(&str, &str)> = results
        .iter()
        .filter(|r| r.success)
        .filter_map(|r| r.content.as_deref().map(|c| (r.agent_id.as_str(), c)))
        .collect();

    if successes.is_empty() {
        return AggregatedOutcome::failed(strategy, latency_ms);
    }

    match strategy {
        AggregationStrategy::FirstSuccess => {
            let (agent, content) = successes[0];
            selected(agent, content, context.score(agent, content), strategy, latency_ms)
        }
        AggregationStrategy::BestOf => {
            let mut best = successes[0];
            let mut best_score = context.score(best.0, best.1);
            for &(agent, content) in &successes[1..] {
                let s = context.score(agent, content);
                if s > best_score {
                    best = (agent, content);
                    best_score = s;
                }
            }
            selected(best.0, best.1, best_score, strategy, latency_ms)
        }
        AggregationStrategy::MergeConcat => {
            let merged = successes
                .iter()
                .map(|(agent, content)| format!("【{}】{}", context.display_name(agent), content))
                .collect::<Vec<_>>()
                .join("\n\n");
            let quality = successes
                .iter()
                .map(|(agent, content)| context.score(agent, content))
                .sum::<f64>()
                / successes.len() as f64;
            AggregatedOutcome {
                content: Some(merged),
                selected_agent: None,
                contributors: successes.iter().map(|(a, _)| a.to_string()).collect(),
                quality,
                strategy,
                latency_ms,
                failed: false,
            }
        }
    }
}

fn selected(
    agent: &str,
    content: &str,
    quality: f64,
    strategy: AggregationStrategy,
    latency_ms: u64,
) -> AggregatedOutcome {
    AggregatedOutcome {
        content: Some(content.to_string()),
        selected_agent: Some(agent.to_string()),
        contributors: vec![agent.to_string()],
        quality,
        strategy,
        latency_ms,
        failed: false,
    }
}

/// Errors of the failed outcomes, in declared order.
pub fn stage_errors(results: &[AgentOutcome]) -> Vec<AgentErrorInfo> {
    results.iter().filter_map(|r| r.error.clone()).collect()
}
