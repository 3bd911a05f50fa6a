//! LLM provider construction.
//!
//! [`create_provider`] builds the adapter for one `[[providers]]` entry,
//! resolving its API key from the environment. [`build_registry`] does this
//! for every enabled entry and tolerates individual failures: a provider that
//! cannot be built or fails its own config validation is skipped, and an
//! agent bound to it fails at call time with an `agent_error` while the run
//! carries on.

pub mod openai_compat;

use secrecy::SecretString;

use chorus_core::llm::box_provider::BoxLlmProvider;
use chorus_core::llm::registry::ProviderRegistry;
use chorus_core::llm::scripted::ScriptedProvider;
use chorus_types::llm::{LlmError, ProviderConfig, ProviderType};

use self::openai_compat::OpenAiCompatibleProvider;
use self::openai_compat::config::OpenAiCompatConfig;

/// Read the API key named by `config.api_key_env`.
pub fn resolve_api_key(config: &ProviderConfig) -> Result<SecretString, LlmError> {
    let var = config.api_key_env.as_deref().ok_or_else(|| {
        LlmError::Auth(format!("provider '{}' has no api_key_env", config.name))
    })?;
    match std::env::var(var) {
        Ok(key) if !key.trim().is_empty() => Ok(SecretString::from(key)),
        _ => Err(LlmError::Auth(format!(
            "environment variable {var} is not set (provider '{}')",
            config.name
        ))),
    }
}

/// Create a [`BoxLlmProvider`] from a [`ProviderConfig`].
pub fn create_provider(config: &ProviderConfig) -> Result<BoxLlmProvider, LlmError> {
    match config.provider_type {
        ProviderType::OpenAiCompatible => {
            let api_key = resolve_api_key(config)?;
            let oai_config = OpenAiCompatConfig::from_provider_config(config, api_key)?;
            Ok(BoxLlmProvider::new(OpenAiCompatibleProvider::new(oai_config)))
        }
        ProviderType::Scripted => Ok(BoxLlmProvider::new(ScriptedProvider::new(&config.name))),
    }
}

/// Register every enabled provider.
///
/// With `offline`, each entry is served by a [`ScriptedProvider`] under the
/// same name so agent bindings keep resolving without network access.
pub fn build_registry(providers: &[ProviderConfig], offline: bool) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    for config in providers.iter().filter(|p| p.enabled) {
        if offline {
            registry.register(
                config.name.clone(),
                BoxLlmProvider::new(ScriptedProvider::new(&config.name)),
            );
            continue;
        }
        match create_provider(config) {
            Ok(provider) => {
                register_validated(&mut registry, config, provider);
            }
            Err(e) => {
                tracing::warn!(provider = %config.name, error = %e, "provider unavailable");
            }
        }
    }
    registry
}

/// Register `provider` under `config.name` only if it accepts `config`.
fn register_validated(
    registry: &mut ProviderRegistry,
    config: &ProviderConfig,
    provider: BoxLlmProvider,
) -> bool {
    if !provider.validate_config(config) {
        tracing::warn!(provider = %config.name, "provider config failed validation, skipping");
        return false;
    }
    tracing::debug!(provider = %config.name, kind = %config.provider_type, "provider registered");
    registry.register(config.name.clone(), provider);
    true
}
