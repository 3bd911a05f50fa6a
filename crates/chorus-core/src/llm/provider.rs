//! LlmProvider trait definition.
//!
//! This is the contract every provider adapter satisfies. Uses RPITIT for
//! `complete` and `count_tokens`, and `Pin<Box<dyn Stream>>` for `stream`
//! (streams need to be object-safe for the BoxLlmProvider wrapper).

use std::pin::Pin;

use futures_util::Stream;

use chorus_types::llm::{
    CompletionRequest, CompletionResponse, LlmError, ProviderCapabilities, ProviderConfig,
    StreamEvent, TokenCount,
};

/// Stream of provider events; chunks arrive as `StreamEvent::TextDelta`.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, LlmError>> + Send + 'static>>;

/// Trait for LLM provider backends.
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition) for
/// `complete` and `count_tokens`. Every failure is reported through the
/// uniform [`LlmError`] taxonomy, whatever the backend.
///
/// Implementations live in chorus-infra (e.g., `OpenAiCompatibleProvider`)
/// and in [`super::scripted`].
pub trait LlmProvider: Send + Sync {
    /// Registry name of this provider (e.g., "openai").
    fn name(&self) -> &str;

    /// What this provider supports.
    fn capabilities(&self) -> &ProviderCapabilities;

    /// Send a completion request and receive the full response.
    fn complete(
        &self,
        request: &CompletionRequest,
    ) -> impl std::future::Future<Output = Result<CompletionResponse, LlmError>> + Send;

    /// Send a streaming completion request. Returns a stream of events.
    fn stream(&self, request: CompletionRequest) -> EventStream;

    /// Count the tokens in a request without sending it to the LLM.
    fn count_tokens(
        &self,
        request: &CompletionRequest,
    ) -> impl std::future::Future<Output = Result<TokenCount, LlmError>> + Send;

    /// Whether `config` is usable with this provider.
    fn validate_config(&self, config: &ProviderConfig) -> bool;
}
