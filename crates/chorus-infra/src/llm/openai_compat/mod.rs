//! OpenAI-compatible LLM provider.
//!
//! One [`OpenAiCompatibleProvider`] serves any endpoint speaking the OpenAI
//! chat completions protocol (OpenAI, Mistral, Gemini's compatibility
//! layer, local gateways). The model code comes from each request.

pub mod config;
pub mod streaming;

use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessage, ChatCompletionRequestAssistantMessageContent,
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessage,
    ChatCompletionRequestUserMessageContent, ChatCompletionStreamOptions,
    CreateChatCompletionRequest, StopConfiguration,
};
use futures_util::StreamExt;
use secrecy::ExposeSecret;

use chorus_core::llm::estimate_request_tokens;
use chorus_core::llm::provider::{EventStream, LlmProvider};
use chorus_types::llm::{
    CompletionRequest, CompletionResponse, LlmError, MessageRole, ProviderCapabilities,
    ProviderConfig, StopReason, TokenCount, Usage,
};

use self::config::OpenAiCompatConfig;
use self::streaming::map_openai_stream;

/// Provider for any OpenAI-compatible API.
///
/// Does not derive Debug: the client holds the API key.
pub struct OpenAiCompatibleProvider {
    client: Client<OpenAIConfig>,
    provider_name: String,
    capabilities: ProviderCapabilities,
}

impl OpenAiCompatibleProvider {
    pub fn new(config: OpenAiCompatConfig) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(config.api_key.expose_secret())
            .with_api_base(&config.base_url);

        Self {
            client: Client::with_config(openai_config),
            provider_name: config.provider_name,
            capabilities: config.capabilities,
        }
    }

    fn build_request(request: &CompletionRequest, stream: bool) -> CreateChatCompletionRequest {
        let mut messages: Vec<ChatCompletionRequestMessage> = Vec::new();

        if let Some(ref system) = request.system {
            messages.push(system_message(system));
        }

        for msg in &request.messages {
            let oai_msg = match msg.role {
                MessageRole::System => system_message(&msg.content),
                MessageRole::User => {
                    ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                        content: ChatCompletionRequestUserMessageContent::Text(msg.content.clone()),
                        name: None,
                    })
                }
                MessageRole::Assistant => {
                    #[allow(deprecated)]
                    ChatCompletionRequestMessage::Assistant(ChatCompletionRequestAssistantMessage {
                        content: Some(ChatCompletionRequestAssistantMessageContent::Text(
                            msg.content.clone(),
                        )),
                        refusal: None,
                        name: None,
                        audio: None,
                        tool_calls: None,
                        function_call: None,
                    })
                }
            };
            messages.push(oai_msg);
        }

        let mut req = CreateChatCompletionRequest {
            model: request.model.clone(),
            messages,
            max_completion_tokens: Some(request.max_tokens),
            temperature: request.temperature.map(|t| t as f32),
            ..Default::default()
        };

        if let Some(stops) = request.stop_sequences.as_ref().filter(|s| !s.is_empty()) {
            req.stop = Some(StopConfiguration::StringArray(stops.clone()));
        }

        if stream {
            req.stream = Some(true);
            req.stream_options = Some(ChatCompletionStreamOptions {
                include_usage: Some(true),
                include_obfuscation: None,
            });
        }

        req
    }
}

fn system_message(content: &str) -> ChatCompletionRequestMessage {
    ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
        content: ChatCompletionRequestSystemMessageContent::Text(content.to_string()),
        name: None,
    })
}

impl LlmProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    fn capabilities(&self) -> &ProviderCapabilities {
        &self.capabilities
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let oai_request = Self::build_request(request, false);

        let response = self
            .client
            .chat()
            .create(oai_request)
            .await
            .map_err(map_openai_error)?;

        let choice = response
            .choices
            .first()
            .ok_or_else(|| LlmError::MalformedResponse("response has no choices".into()))?;
        let content = choice.message.content.clone().unwrap_or_default();
        let stop_reason = choice
            .finish_reason
            .as_ref()
            .map(streaming::stop_reason)
            .unwrap_or(StopReason::EndTurn);

        let usage = response
            .usage
            .map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            id: response.id,
            content,
            model: response.model,
            stop_reason,
            usage,
        })
    }

    fn stream(&self, request: CompletionRequest) -> EventStream {
        let oai_request = Self::build_request(&request, true);
        let client = self.client.clone();

        Box::pin(async_stream::try_stream! {
            let oai_stream = client
                .chat()
                .create_stream(oai_request)
                .await
                .map_err(map_openai_error)?;

            let mut inner = map_openai_stream(oai_stream);
            while let Some(event) = inner.next().await {
                yield event?;
            }
        })
    }

    async fn count_tokens(&self, request: &CompletionRequest) -> Result<TokenCount, LlmError> {
        Ok(TokenCount {
            input_tokens: estimate_request_tokens(request),
        })
    }

    fn validate_config(&self, config: &ProviderConfig) -> bool {
        config::validate(config)
    }
}

/// Map an `async_openai` error onto the uniform [`LlmError`] taxonomy.
pub(crate) fn map_openai_error(err: async_openai::error::OpenAIError) -> LlmError {
    use async_openai::error::OpenAIError;

    match &err {
        OpenAIError::ApiError(api_err) => {
            let code = api_err.code.as_deref().unwrap_or("");
            let error_type = api_err.r#type.as_deref().unwrap_or("");

            if code == "invalid_api_key"
                || code == "authentication_error"
                || error_type == "authentication_error"
                || api_err.message.contains("Incorrect API key")
                || api_err.message.contains("Invalid API key")
            {
                LlmError::Auth(api_err.message.clone())
            } else if code == "rate_limit_exceeded"
                || error_type == "rate_limit_error"
                || error_type == "requests"
            {
                LlmError::RateLimited {
                    retry_after_ms: None,
                }
            } else {
                LlmError::Unknown(err.to_string())
            }
        }
        OpenAIError::Reqwest(reqwest_err) => {
            if reqwest_err.is_timeout() {
                return LlmError::Timeout;
            }
            match reqwest_err.status().map(|s| s.as_u16()) {
                Some(401 | 403) => LlmError::Auth(err.to_string()),
                Some(429) => LlmError::RateLimited {
                    retry_after_ms: None,
                },
                Some(408 | 504) => LlmError::Timeout,
                _ => LlmError::Unknown(err.to_string()),
            }
        }
        OpenAIError::JSONDeserialize(_, content) => {
            LlmError::MalformedResponse(format!("failed to parse response: {content}"))
        }
        _ => LlmError::Unknown(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_types::llm::{Message, ProviderType};
    use secrecy::SecretString;

    fn provider() -> OpenAiCompatibleProvider {
        let config = ProviderConfig {
            name: "openai".into(),
            provider_type: ProviderType::OpenAiCompatible,
            base_url: None,
            api_key_env: Some("OPENAI_API_KEY".into()),
            enabled: true,
        };
        OpenAiCompatibleProvider::new(
            OpenAiCompatConfig::from_provider_config(
                &config,
                SecretString::from("sk-test".to_string()),
            )
            .unwrap(),
        )
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "gpt-4o-mini".into(),
            messages: vec![
                Message::user("I had a rough week"),
                Message::assistant("[empathy] that sounds hard"),
                Message::user("any advice?"),
            ],
            system: Some("You are Fixer.".into()),
            max_tokens: 256,
            temperature: Some(0.5),
            stream: true,
            stop_sequences: Some(vec![]),
        }
    }

    #[test]
    fn test_provider_identity() {
        let provider = provider();
        assert_eq!(provider.name(), "openai");
        assert!(provider.capabilities().streaming);
    }

    #[test]
    fn test_build_request_prepends_system() {
        let req = OpenAiCompatibleProvider::build_request(&request(), true);
        assert_eq!(req.model, "gpt-4o-mini");
        assert_eq!(req.messages.len(), 4);
        assert!(matches!(req.messages[0], ChatCompletionRequestMessage::System(_)));
        assert!(matches!(req.messages[2], ChatCompletionRequestMessage::Assistant(_)));
        assert_eq!(req.max_completion_tokens, Some(256));
        assert_eq!(req.stream, Some(true));
        assert!(req.stop.is_none(), "empty stop list is not sent");
        assert!(req.stream_options.is_some());
    }

    #[test]
    fn test_build_request_non_streaming() {
        let req = OpenAiCompatibleProvider::build_request(&request(), false);
        assert!(req.stream.is_none());
        assert!(req.stream_options.is_none());
    }

    #[tokio::test]
    async fn test_count_tokens_estimates() {
        let count = provider().count_tokens(&request()).await.unwrap();
        assert!(count.input_tokens > 0);
    }
}
