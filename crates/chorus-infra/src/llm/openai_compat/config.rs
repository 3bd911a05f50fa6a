//! Connection settings for OpenAI-compatible endpoints.
//!
//! Well-known provider names get their base URL filled in; anything else
//! must set `base_url` explicitly in `chorus.toml`.

use secrecy::SecretString;

use chorus_types::llm::{LlmError, ProviderCapabilities, ProviderConfig};

/// Resolved configuration for an [`super::OpenAiCompatibleProvider`].
pub struct OpenAiCompatConfig {
    /// Registry name (e.g., "openai", "mistral").
    pub provider_name: String,
    pub base_url: String,
    pub api_key: SecretString,
    pub capabilities: ProviderCapabilities,
}

/// Base URL for a well-known provider name.
pub fn default_base_url(provider_name: &str) -> Option<&'static str> {
    match provider_name {
        "openai" => Some("https://api.openai.com/v1"),
        "gemini" => Some("https://generativelanguage.googleapis.com/v1beta/openai"),
        "mistral" => Some("https://api.mistral.ai/v1"),
        "glm" => Some("https://api.z.ai/api/paas/v4"),
        "deepseek" => Some("https://api.deepseek.com/v1"),
        _ => None,
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("https://") || url.starts_with("http://")
}

impl OpenAiCompatConfig {
    /// Resolve the base URL for `config` and attach the API key.
    pub fn from_provider_config(
        config: &ProviderConfig,
        api_key: SecretString,
    ) -> Result<Self, LlmError> {
        let base_url = match config.base_url.as_deref() {
            Some(url) if is_http_url(url) => url.trim_end_matches('/').to_string(),
            Some(url) => {
                return Err(LlmError::Unknown(format!(
                    "provider '{}' has an invalid base_url: {url}",
                    config.name
                )));
            }
            None => default_base_url(&config.name)
                .ok_or_else(|| {
                    LlmError::Unknown(format!(
                        "provider '{}' needs a base_url (no default known)",
                        config.name
                    ))
                })?
                .to_string(),
        };

        Ok(Self {
            provider_name: config.name.clone(),
            base_url,
            api_key,
            capabilities: ProviderCapabilities::default(),
        })
    }
}

/// Static checks on a provider entry: type, base URL shape, and key source.
pub fn validate(config: &ProviderConfig) -> bool {
    use chorus_types::llm::ProviderType;

    if config.provider_type != ProviderType::OpenAiCompatible {
        return false;
    }
    let url_ok = match config.base_url.as_deref() {
        Some(url) => is_http_url(url),
        None => default_base_url(&config.name).is_some(),
    };
    let key_ok = config
        .api_key_env
        .as_deref()
        .is_some_and(|name| !name.trim().is_empty());
    url_ok && key_ok
}
