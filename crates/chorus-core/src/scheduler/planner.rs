//! Per-mode plan builders.
//!
//! Each builder returns stages over enabled agents only; an empty result
//! means "nothing eligible" and the caller substitutes the minimum viable
//! plan.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use chorus_types::analysis::AnalysisResult;
use chorus_types::config::RecommendationSource;
use chorus_types::plan::{AggregationStrategy, ExecutionMode, Flow};

use crate::agent::registry::AgentRegistry;

/// Stage blueprint before limits are attached.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StageDraft {
    pub name: String,
    pub execution: ExecutionMode,
    pub agents: Vec<String>,
    pub strategy: AggregationStrategy,
    pub required_markers: Vec<String>,
}

impl StageDraft {
    fn single(agent: &str, strategy: AggregationStrategy) -> Self {
        Self {
            name: agent.to_string(),
            execution: ExecutionMode::Sequential,
            agents: vec![agent.to_string()],
            strategy,
            required_markers: Vec::new(),
        }
    }
}

/// Shuffle `items` reproducibly from `seed`.
pub fn seeded_shuffle<T>(items: &mut [T], seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    items.shuffle(&mut rng);
}

/// Fixed mode: the flow's stages with disabled or unknown roles removed.
pub(crate) fn fixed(flow: Option<&Flow>, registry: &AgentRegistry) -> Vec<StageDraft> {
    let Some(flow) = flow else {
        return Vec::new();
    };
    flow.stages
        .iter()
        .filter_map(|stage| {
            let agents: Vec<String> = stage
                .roles
                .iter()
                .filter(|role| registry.is_enabled(role))
                .cloned()
                .collect();
            if agents.is_empty() {
                tracing::debug!(stage = %stage.name, flow = %flow.name, "dropping empty flow stage");
                return None;
            }
            Some(StageDraft {
                name: stage.name.clone(),
                execution: stage.execution,
                agents,
                strategy: stage.strategy,
                required_markers: stage.required_markers.clone(),
            })
        })
        .collect()
}

/// Candidate agents for dynamic and smart plans, by priority, declared
/// order, then recommendation rank. Capped at `max`.
pub(crate) fn candidates(
    analysis: &AnalysisResult,
    registry: &AgentRegistry,
    source: RecommendationSource,
    max: usize,
) -> Vec<String> {
    let mut picked: Vec<String> = Vec::new();

    if matches!(
        source,
        RecommendationSource::Analysis | RecommendationSource::AnalysisThenCapabilities
    ) {
        for id in &analysis.recommended {
            if registry.is_enabled(id) && !picked.contains(id) {
                picked.push(id.clone());
            }
        }
    }

    if matches!(
        source,
        RecommendationSource::Capabilities | RecommendationSource::AnalysisThenCapabilities
    ) {
        let mut labels = vec![analysis.scene_type.to_string()];
        labels.extend(analysis.topics.iter().cloned());
        for agent in registry.with_any_capability(&labels) {
            if !picked.contains(&agent.role) {
                picked.push(agent.role.clone());
            }
        }
    }

    let mut ranked: Vec<(usize, String)> = picked.into_iter().enumerate().collect();
    ranked.sort_by_key(|(rec_rank, id)| {
        let rank = registry.get(id).map(|a| a.rank()).unwrap_or((u32::MAX, u32::MAX));
        (rank, *rec_rank)
    });
    ranked.into_iter().map(|(_, id)| id).take(max.max(1)).collect()
}

/// Dynamic mode: one sequential merge-concat stage over the candidates.
pub(crate) fn dynamic(agents: Vec<String>) -> Vec<StageDraft> {
    if agents.is_empty() {
        return Vec::new();
    }
    vec![StageDraft {
        name: "respond".to_string(),
        execution: ExecutionMode::Sequential,
        agents,
        strategy: AggregationStrategy::MergeConcat,
        required_markers: Vec::new(),
    }]
}

/// Smart mode: one single-agent stage per candidate, reviewed after each.
pub(crate) fn smart(agents: Vec<String>) -> Vec<StageDraft> {
    agents
        .iter()
        .map(|a| StageDraft::single(a, AggregationStrategy::FirstSuccess))
        .collect()
}

/// Natural mode: participants (or all enabled agents) in seeded random order.
pub(crate) fn natural(
    participants: &[String],
    registry: &AgentRegistry,
    seed: u64,
) -> Vec<StageDraft> {
    let mut agents: Vec<String> = if participants.is_empty() {
        registry.enabled_ids()
    } else {
        let mut chosen: Vec<String> = Vec::new();
        for id in participants {
            if registry.is_enabled(id) && !chosen.contains(id) {
                chosen.push(id.clone());
            }
        }
        chosen
    };
    seeded_shuffle(&mut agents, seed);
    agents
        .iter()
        .map(|a| StageDraft::single(a, AggregationStrategy::FirstSuccess))
        .collect()
}

/// Minimum viable plan: the first enabled agent alone.
pub(crate) fn minimal(registry: &AgentRegistry) -> Vec<StageDraft> {
    registry
        .enabled()
        .next()
        .map(|a| vec![StageDraft::single(&a.role, AggregationStrategy::FirstSuccess)])
        .unwrap_or_default()
}

/// Fallback for fixed mode without a usable flow.
pub(crate) fn all_enabled(registry: &AgentRegistry) -> Vec<StageDraft> {
    dynamic(registry.enabled_ids())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_shuffle_is_reproducible() {
        let base: Vec<u32> = (0..10).collect();
        let mut a = base.clone();
        let mut b = base.clone();
        seeded_shuffle(&mut a, 42);
        seeded_shuffle(&mut b, 42);
        assert_eq!(a, b);

        let mut sorted = a.clone();
        sorted.sort();
        assert_eq!(sorted, base);
    }
}
