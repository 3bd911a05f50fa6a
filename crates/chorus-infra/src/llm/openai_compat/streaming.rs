//! OpenAI SSE stream to [`StreamEvent`] adapter.
//!
//! Emits, in order: `Connected`, one `TextDelta` per non-empty content
//! chunk, `MessageDelta` when a finish reason arrives, `Usage` when the
//! server reports it (requires `stream_options.include_usage`), then `Done`.

use futures_util::StreamExt;

use async_openai::types::chat::{ChatCompletionResponseStream, FinishReason};

use chorus_core::llm::provider::EventStream;
use chorus_types::llm::{LlmError, StopReason, StreamEvent, Usage};

/// Translate an OpenAI finish reason.
pub(crate) fn stop_reason(reason: &FinishReason) -> StopReason {
    match reason {
        FinishReason::Length => StopReason::MaxTokens,
        FinishReason::Stop
        | FinishReason::ToolCalls
        | FinishReason::ContentFilter
        | FinishReason::FunctionCall => StopReason::EndTurn,
    }
}

/// Map an async-openai [`ChatCompletionResponseStream`] to a stream of [`StreamEvent`]s.
pub fn map_openai_stream(stream: ChatCompletionResponseStream) -> EventStream {
    Box::pin(async_stream::try_stream! {
        yield StreamEvent::Connected;

        let mut stream = stream;
        while let Some(result) = stream.next().await {
            let chunk = result.map_err(super::map_openai_error)?;

            for choice in &chunk.choices {
                if let Some(text) = choice.delta.content.as_deref() {
                    if !text.is_empty() {
                        yield StreamEvent::TextDelta {
                            index: choice.index,
                            text: text.to_string(),
                        };
                    }
                }
                if let Some(reason) = choice.finish_reason.as_ref() {
                    yield StreamEvent::MessageDelta {
                        stop_reason: stop_reason(reason),
                    };
                }
            }

            // The usage chunk arrives last, with an empty choices array.
            if let Some(usage) = chunk.usage.as_ref() {
                yield StreamEvent::Usage(Usage {
                    input_tokens: usage.prompt_tokens,
                    output_tokens: usage.completion_tokens,
                });
            }
        }

        yield StreamEvent::Done;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reasons_collapse_onto_stop_reasons() {
        let cases = [
            (FinishReason::Stop, StopReason::EndTurn),
            (FinishReason::Length, StopReason::MaxTokens),
            (FinishReason::ToolCalls, StopReason::EndTurn),
            (FinishReason::ContentFilter, StopReason::EndTurn),
            (FinishReason::FunctionCall, StopReason::EndTurn),
        ];
        for (finish, expected) in cases {
            assert_eq!(stop_reason(&finish), expected);
        }
    }
}
