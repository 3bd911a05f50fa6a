//! Deterministic in-process provider.
//!
//! `ScriptedProvider` replays queued replies per model code. It backs the
//! CLI's offline mode and every engine test: replies can stream in chunks,
//! carry usage, pause between chunks, or fail with any [`LlmError`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chorus_types::llm::{
    CompletionRequest, CompletionResponse, LlmError, MessageRole, ProviderCapabilities,
    ProviderConfig, ProviderType, StopReason, StreamEvent, TokenCount, Usage,
};

use super::estimate_request_tokens;
use super::provider::{EventStream, LlmProvider};

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Stream these chunks, then report usage (estimated when `None`).
    Text {
        chunks: Vec<String>,
        usage: Option<Usage>,
    },
    /// Stream these chunks, then fail.
    FailAfter { chunks: Vec<String>, error: LlmError },
    /// Fail before producing anything.
    Error(LlmError),
}

impl ScriptedReply {
    pub fn text(text: impl Into<String>) -> Self {
        ScriptedReply::Text {
            chunks: vec![text.into()],
            usage: None,
        }
    }

    pub fn chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ScriptedReply::Text {
            chunks: chunks.into_iter().map(Into::into).collect(),
            usage: None,
        }
    }

    pub fn with_usage(self, usage: Usage) -> Self {
        match self {
            ScriptedReply::Text { chunks, .. } => ScriptedReply::Text {
                chunks,
                usage: Some(usage),
            },
            other => other,
        }
    }

    pub fn error(error: LlmError) -> Self {
        ScriptedReply::Error(error)
    }
}

#[derive(Default)]
struct Script {
    queues: HashMap<String, VecDeque<ScriptedReply>>,
    defaults: HashMap<String, ScriptedReply>,
}

/// Shared log of every request the provider received.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    inner: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl CallLog {
    fn push(&self, request: CompletionRequest) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);
    }

    /// Snapshot of recorded requests, oldest first.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Provider that replays scripted replies keyed by model code.
///
/// Lookup order per call: the model's queue, then the model's default,
/// then a generated acknowledgement of the last user message.
pub struct ScriptedProvider {
    name: String,
    capabilities: ProviderCapabilities,
    script: Arc<Mutex<Script>>,
    chunk_delay: Option<Duration>,
    calls: CallLog,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: ProviderCapabilities::default(),
            script: Arc::new(Mutex::new(Script::default())),
            chunk_delay: None,
            calls: CallLog::default(),
        }
    }

    /// Queue a reply for the next call against `model`.
    pub fn push_reply(self, model: impl Into<String>, reply: ScriptedReply) -> Self {
        self.lock_script()
            .queues
            .entry(model.into())
            .or_default()
            .push_back(reply);
        self
    }

    /// Reply used for `model` once its queue is empty.
    pub fn with_default(self, model: impl Into<String>, reply: ScriptedReply) -> Self {
        self.lock_script().defaults.insert(model.into(), reply);
        self
    }

    /// Pause before each streamed chunk.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Handle onto the request log; stays valid after boxing the provider.
    pub fn call_log(&self) -> CallLog {
        self.calls.clone()
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_reply(&self, request: &CompletionRequest) -> ScriptedReply {
        let mut script = self.lock_script();
        if let Some(reply) = script
            .queues
            .get_mut(&request.model)
            .and_then(|q| q.pop_front())
        {
            return reply;
        }
        if let Some(reply) = script.defaults.get(&request.model) {
            return reply.clone();
        }
        ScriptedReply::text(acknowledge(request))
    }
}

/// Deterministic reply used when nothing was scripted.
fn acknowledge(request: &CompletionRequest) -> String {
    let last_user = request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::User)
        .map(|m| m.content.as_str())
        .unwrap_or("");
    let excerpt: String = last_user.chars().take(40).collect();
    format!("[{}] {}", request.model, excerpt)
}

impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &ProviderCapabilities {
        &self.capabilities
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.push(request.clone());
        match self.next_reply(request) {
            ScriptedReply::Text { chunks, usage } => {
                let content = chunks.concat();
                let usage = usage.unwrap_or_else(|| super::estimate_usage(request, &content));
                Ok(CompletionResponse {
                    id: format!("scripted-{}", self.calls.len()),
                    content,
                    model: request.model.clone(),
                    stop_reason: StopReason::EndTurn,
                    usage,
                })
            }
            ScriptedReply::FailAfter { error, .. } | ScriptedReply::Error(error) => Err(error),
        }
    }

    fn stream(&self, request: CompletionRequest) -> EventStream {
        self.calls.push(request.clone());
        let reply = self.next_reply(&request);
        let delay = self.chunk_delay;

        Box::pin(async_stream::try_stream! {
            yield StreamEvent::Connected;
            match reply {
                ScriptedReply::Text { chunks, usage } => {
                    let mut full = String::new();
                    for chunk in chunks {
                        if let Some(delay) = delay {
                            tokio::time::sleep(delay).await;
                        }
                        full.push_str(&chunk);
                        yield StreamEvent::TextDelta { index: 0, text: chunk };
                    }
                    let usage = usage.unwrap_or_else(|| super::estimate_usage(&request, &full));
                    yield StreamEvent::MessageDelta { stop_reason: StopReason::EndTurn };
                    yield StreamEvent::Usage(usage);
                    yield StreamEvent::Done;
                }
                ScriptedReply::FailAfter { chunks, error } => {
                    for chunk in chunks {
                        if let Some(delay) = delay {
                            tokio::time::sleep(delay).await;
                        }
                        yield StreamEvent::TextDelta { index: 0, text: chunk };
                    }
                    Err::<(), LlmError>(error)?;
                }
                ScriptedReply::Error(error) => {
                    Err::<(), LlmError>(error)?;
                }
            }
        })
    }

    async fn count_tokens(&self, request: &CompletionRequest) -> Result<TokenCount, LlmError> {
        Ok(TokenCount {
            input_tokens: estimate_request_tokens(request),
        })
    }

    fn validate_config(&self, config: &ProviderConfig) -> bool {
        config.provider_type == ProviderType::Scripted
    }
}
