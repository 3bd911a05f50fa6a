//! Agent registry and model resolution.
//!
//! `AgentRegistry` is an immutable, rank-ordered view over the agent
//! definitions loaded for one run. Role tags are unique; constructing a
//! registry with a duplicate role fails.
//!
//! `ModelCatalog` turns an agent's model reference into a concrete
//! [`ModelBinding`] plus the provider that serves it.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use chorus_types::agent::AgentDefinition;
use chorus_types::llm::ModelBinding;

use crate::llm::box_provider::BoxLlmProvider;
use crate::llm::registry::ProviderRegistry;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistryError {
    #[error("duplicate agent role '{0}'")]
    DuplicateRole(String),

    #[error("agent '{role}' references unknown model '{model}'")]
    UnknownModel { role: String, model: String },

    #[error("model '{model}' references unregistered provider '{provider}'")]
    UnknownProvider { model: String, provider: String },
}

/// Rank-ordered agent definitions, indexed by role tag.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: Vec<AgentDefinition>,
    index: HashMap<String, usize>,
}

impl AgentRegistry {
    pub fn new(mut agents: Vec<AgentDefinition>) -> Result<Self, RegistryError> {
        agents.sort_by_key(|a| a.rank());
        let mut index = HashMap::with_capacity(agents.len());
        for (i, agent) in agents.iter().enumerate() {
            if index.insert(agent.role.clone(), i).is_some() {
                return Err(RegistryError::DuplicateRole(agent.role.clone()));
            }
        }
        Ok(Self { agents, index })
    }

    pub fn get(&self, role: &str) -> Option<&AgentDefinition> {
        self.index.get(role).map(|&i| &self.agents[i])
    }

    /// All definitions, by priority then declared order.
    pub fn all(&self) -> &[AgentDefinition] {
        &self.agents
    }

    /// Enabled definitions, by priority then declared order.
    pub fn enabled(&self) -> impl Iterator<Item = &AgentDefinition> {
        self.agents.iter().filter(|a| a.enabled)
    }

    pub fn enabled_ids(&self) -> Vec<String> {
        self.enabled().map(|a| a.role.clone()).collect()
    }

    pub fn is_enabled(&self, role: &str) -> bool {
        self.get(role).is_some_and(|a| a.enabled)
    }

    /// Enabled agents with a capability tag matching any of `labels`.
    pub fn with_any_capability(&self, labels: &[String]) -> Vec<&AgentDefinition> {
        self.enabled()
            .filter(|a| labels.iter().any(|l| a.has_capability(l)))
            .collect()
    }

    /// Display name for a role, falling back to the role tag itself.
    pub fn display_name<'a>(&'a self, role: &'a str) -> &'a str {
        self.get(role).map_or(role, |a| a.display_name.as_str())
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// An agent bound to a concrete model and provider for one run.
#[derive(Debug, Clone)]
pub struct ResolvedAgent {
    pub definition: AgentDefinition,
    pub binding: ModelBinding,
    pub provider: Arc<BoxLlmProvider>,
}

/// Model bindings indexed by id.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    bindings: HashMap<String, ModelBinding>,
}

impl ModelCatalog {
    pub fn new(bindings: impl IntoIterator<Item = ModelBinding>) -> Self {
        Self {
            bindings: bindings.into_iter().map(|b| (b.id.clone(), b)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ModelBinding> {
        self.bindings.get(id)
    }

    /// Bind `agent` to its model and provider.
    pub fn resolve(
        &self,
        agent: &AgentDefinition,
        providers: &ProviderRegistry,
    ) -> Result<ResolvedAgent, RegistryError> {
        let binding = self
            .bindings
            .get(&agent.model)
            .ok_or_else(|| RegistryError::UnknownModel {
                role: agent.role.clone(),
                model: agent.model.clone(),
            })?;
        let provider =
            providers
                .get(&binding.provider)
                .ok_or_else(|| RegistryError::UnknownProvider {
                    model: binding.id.clone(),
                    provider: binding.provider.clone(),
                })?;
        Ok(ResolvedAgent {
            definition: agent.clone(),
            binding: binding.clone(),
            provider,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::scripted::ScriptedProvider;
    use chorus_types::llm::{ModelPricing, ProviderCapabilities};

    fn agent(role: &str, priority: u32, order: u32) -> AgentDefinition {
        AgentDefinition {
            role: role.into(),
            display_name: role.to_uppercase(),
            system_prompt: String::new(),
            temperature: 0.7,
            max_tokens: 128,
            model: "fast".into(),
            enabled: true,
            priority,
            order,
            capabilities: vec!["emotional_support".into()],
        }
    }

    fn binding(provider: &str) -> ModelBinding {
        ModelBinding {
            id: "fast".into(),
            provider: provider.into(),
            model: "fast-model".into(),
            context_length: 8_000,
            capabilities: ProviderCapabilities::default(),
            pricing: ModelPricing::default(),
        }
    }

    #[test]
    fn registry_orders_by_rank_and_looks_up_by_role() {
        let registry =
            AgentRegistry::new(vec![agent("b", 2, 0), agent("a", 1, 5), agent("c", 1, 2)])
                .unwrap();
        let order: Vec<&str> = registry.all().iter().map(|a| a.role.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
        assert_eq!(registry.get("a").unwrap().order, 5);
        assert_eq!(registry.display_name("a"), "A");
        assert_eq!(registry.display_name("ghost"), "ghost");
    }

    #[test]
    fn duplicate_roles_are_rejected() {
        let err = AgentRegistry::new(vec![agent("a", 1, 0), agent("a", 2, 1)]).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateRole("a".into()));
    }

    #[test]
    fn disabled_agents_are_not_enabled() {
        let mut off = agent("off", 0, 0);
        off.enabled = false;
        let registry = AgentRegistry::new(vec![off, agent("on", 1, 0)]).unwrap();
        assert_eq!(registry.enabled_ids(), vec!["on"]);
        assert!(!registry.is_enabled("off"));
        assert_eq!(
            registry
                .with_any_capability(&["EMOTIONAL_SUPPORT".to_string()])
                .len(),
            1
        );
    }

    #[test]
    fn resolve_needs_binding_and_provider() {
        let mut providers = ProviderRegistry::new();
        providers.register("scripted", BoxLlmProvider::new(ScriptedProvider::new("scripted")));

        let catalog = ModelCatalog::new([binding("scripted")]);
        let resolved = catalog.resolve(&agent("a", 1, 0), &providers).unwrap();
        assert_eq!(resolved.binding.model, "fast-model");
        assert_eq!(resolved.provider.name(), "scripted");

        let mut unknown = agent("a", 1, 0);
        unknown.model = "slow".into();
        assert!(matches!(
            catalog.resolve(&unknown, &providers),
            Err(RegistryError::UnknownModel { .. })
        ));

        let orphan = ModelCatalog::new([binding("missing")]);
        assert!(matches!(
            orphan.resolve(&agent("a", 1, 0), &providers),
            Err(RegistryError::UnknownProvider { .. })
        ));
    }
}
