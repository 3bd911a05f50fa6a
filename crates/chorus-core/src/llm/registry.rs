//! Provider registry for runtime provider lookup.
//!
//! A name-indexed registry of shared, boxed LLM providers. Model bindings
//! name a provider; the orchestrator resolves it here and nowhere else.

use std::collections::HashMap;
use std::sync::Arc;

use super::box_provider::BoxLlmProvider;

/// Registry of available LLM providers, indexed by name.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<BoxLlmProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under the given name.
    ///
    /// If a provider with this name already exists, it is replaced.
    pub fn register(&mut self, name: impl Into<String>, provider: BoxLlmProvider) {
        self.providers.insert(name.into(), Arc::new(provider));
    }

    /// Look up a provider by name.
    pub fn get(&self, name: &str) -> Option<Arc<BoxLlmProvider>> {
        self.providers.get(name).cloned()
    }

    /// List all registered provider names, sorted.
    pub fn list_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
