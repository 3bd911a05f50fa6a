//! LLM request/response types for Chorus.
//!
//! These types model the data shapes for provider interactions: completion
//! requests, streaming events, usage tracking, model bindings, and the
//! uniform error taxonomy every adapter maps its failures onto.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Role of a message in an LLM conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "system" => Ok(MessageRole::System),
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            other => Err(format!("invalid message role: '{other}'")),
        }
    }
}

/// A single message in an LLM conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Request to an LLM provider for a completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

/// Response from an LLM provider for a non-streaming completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub id: String,
    pub content: String,
    pub model: String,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

/// Reason why the LLM stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::EndTurn => write!(f, "end_turn"),
            StopReason::MaxTokens => write!(f, "max_tokens"),
            StopReason::StopSequence => write!(f, "stop_sequence"),
        }
    }
}

/// Token usage for a completion request/response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Token count for a request (used by count_tokens).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCount {
    pub input_tokens: u32,
}

/// Events emitted during a streaming LLM response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Connection established with the provider.
    Connected,

    /// A chunk of generated text.
    TextDelta { index: u32, text: String },

    /// The message is finishing with a stop reason.
    MessageDelta { stop_reason: StopReason },

    /// Token usage information.
    Usage(Usage),

    /// The stream has completed.
    Done,
}

/// Uniform failure taxonomy for every provider adapter.
///
/// Adapters map transport and API failures onto these five variants so the
/// orchestrator can treat all providers identically.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited (retry after {retry_after_ms:?}ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("provider call timed out")]
    Timeout,

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("provider error: {0}")]
    Unknown(String),
}

impl LlmError {
    /// Machine-readable category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LlmError::Auth(_) => ErrorKind::Auth,
            LlmError::RateLimited { .. } => ErrorKind::RateLimited,
            LlmError::Timeout => ErrorKind::Timeout,
            LlmError::MalformedResponse(_) => ErrorKind::MalformedResponse,
            LlmError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. } | LlmError::Timeout)
    }
}

/// Serializable category of an [`LlmError`], carried in events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    RateLimited,
    Timeout,
    MalformedResponse,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Auth => write!(f, "auth"),
            ErrorKind::RateLimited => write!(f, "rate_limited"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::MalformedResponse => write!(f, "malformed_response"),
            ErrorKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Capabilities of an LLM model/provider pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    #[serde(default = "default_true")]
    pub streaming: bool,
    #[serde(default = "default_context_tokens")]
    pub max_context_tokens: u32,
    #[serde(default = "default_output_tokens")]
    pub max_output_tokens: u32,
}

fn default_true() -> bool {
    true
}

fn default_context_tokens() -> u32 {
    32_000
}

fn default_output_tokens() -> u32 {
    4_096
}

impl Default for ProviderCapabilities {
    fn default() -> Self {
        Self {
            streaming: true,
            max_context_tokens: default_context_tokens(),
            max_output_tokens: default_output_tokens(),
        }
    }
}

/// Type of LLM provider backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    #[serde(rename = "openai_compatible")]
    OpenAiCompatible,
    /// Deterministic in-process provider used offline and in tests.
    Scripted,
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderType::OpenAiCompatible => write!(f, "openai_compatible"),
            ProviderType::Scripted => write!(f, "scripted"),
        }
    }
}

impl FromStr for ProviderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai_compatible" => Ok(ProviderType::OpenAiCompatible),
            "scripted" => Ok(ProviderType::Scripted),
            other => Err(format!("invalid provider type: '{other}'")),
        }
    }
}

/// Connection settings for a single provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Registry name agents' model bindings refer to (e.g., "openai").
    pub name: String,
    pub provider_type: ProviderType,
    /// Override the default base URL for the provider.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Cost units charged per million tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    #[serde(default)]
    pub input_cost_per_million: f64,
    #[serde(default)]
    pub output_cost_per_million: f64,
}

impl ModelPricing {
    /// Cost of the given usage under this pricing.
    pub fn cost_of(&self, usage: &Usage) -> f64 {
        let input = usage.input_tokens as f64 / 1_000_000.0 * self.input_cost_per_million;
        let output = usage.output_tokens as f64 / 1_000_000.0 * self.output_cost_per_million;
        input + output
    }
}

/// A model reference resolved to a concrete provider.
///
/// Resolved when the plan is built and never changed while it executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelBinding {
    /// Reference used by agent definitions (e.g., "fast").
    pub id: String,
    /// Provider registry name.
    pub provider: String,
    /// Model code sent to the provider.
    pub model: String,
    #[serde(default = "default_context_tokens")]
    pub context_length: u32,
    #[serde(default)]
    pub capabilities: ProviderCapabilities,
    #[serde(default)]
    pub pricing: ModelPricing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_role_roundtrip() {
        for role in [MessageRole::System, MessageRole::User, MessageRole::Assistant] {
            let s = role.to_string();
            let parsed: MessageRole = s.parse().unwrap();
            assert_eq!(role, parsed);
        }
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(LlmError::Auth("bad key".into()).kind(), ErrorKind::Auth);
        assert_eq!(LlmError::Timeout.kind(), ErrorKind::Timeout);
        assert_eq!(
            LlmError::RateLimited { retry_after_ms: Some(10) }.kind(),
            ErrorKind::RateLimited
        );
        assert_eq!(
            LlmError::MalformedResponse("eof".into()).kind(),
            ErrorKind::MalformedResponse
        );
        assert_eq!(LlmError::Unknown("boom".into()).kind(), ErrorKind::Unknown);
    }

    #[test]
    fn test_transient_errors() {
        assert!(LlmError::Timeout.is_transient());
        assert!(LlmError::RateLimited { retry_after_ms: None }.is_transient());
        assert!(!LlmError::Auth("x".into()).is_transient());
        assert!(!LlmError::Unknown("x".into()).is_transient());
    }

    #[test]
    fn test_pricing_cost_of() {
        let pricing = ModelPricing {
            input_cost_per_million: 2.0,
            output_cost_per_million: 10.0,
        };
        let usage = Usage {
            input_tokens: 500_000,
            output_tokens: 100_000,
        };
        assert!((pricing.cost_of(&usage) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_stream_event_serde_tag() {
        let ev = StreamEvent::TextDelta {
            index: 0,
            text: "hi".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "text_delta");
        assert_eq!(json["text"], "hi");
    }

    #[test]
    fn test_model_binding_defaults_from_toml() {
        let binding: ModelBinding = toml::from_str(
            r#"
id = "fast"
provider = "openai"
model = "gpt-4o-mini"
"#,
        )
        .unwrap();
        assert_eq!(binding.context_length, 32_000);
        assert!(binding.capabilities.streaming);
        assert_eq!(binding.pricing, ModelPricing::default());
    }

    #[test]
    fn test_provider_type_parse_rejects_unknown() {
        assert!("anthropic".parse::<ProviderType>().is_err());
        assert_eq!(
            "openai_compatible".parse::<ProviderType>().unwrap(),
            ProviderType::OpenAiCompatible
        );
    }
}
