//! Conversation endpoints.
//!
//! - `POST /api/v1/conversations/{id}/messages` runs one orchestration and
//!   streams its events as SSE, one `event:` per [`OrchestrationEvent`] kind.
//! - `GET /api/v1/conversations/{id}/messages` returns the stored transcript.
//!
//! A client disconnecting mid-stream cancels the run. Replies already
//! persisted stay.
//!
//! [`OrchestrationEvent`]: chorus_types::event::OrchestrationEvent

use std::time::{Duration, Instant};

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde::Deserialize;
use uuid::Uuid;

use chorus_core::orchestrator::{OrchestratorError, RunRequest};
use chorus_core::repository::ConversationRepository;
use chorus_types::conversation::{ConversationMessage, ConversationMode};

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Body of a posted user message.
#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub text: String,
    #[serde(default)]
    pub mode: Option<ConversationMode>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub budget: Option<f64>,
}

impl PostMessageRequest {
    fn into_run_request(self, conversation_id: Uuid) -> Result<RunRequest, AppError> {
        if self.text.trim().is_empty() {
            return Err(AppError::Validation("text must not be empty".into()));
        }
        let mut request = RunRequest::new(conversation_id, self.text);
        if let Some(mode) = self.mode {
            request = request.with_mode(mode);
        }
        if let Some(seed) = self.seed {
            request = request.with_seed(seed);
        }
        if let Some(budget) = self.budget {
            if !budget.is_finite() || budget < 0.0 {
                return Err(AppError::Validation("budget must be a non-negative number".into()));
            }
            request = request.with_budget(budget);
        }
        Ok(request)
    }
}

/// POST /api/v1/conversations/{id}/messages
pub async fn post_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Json(body): Json<PostMessageRequest>,
) -> Result<Response, AppError> {
    let request = body.into_run_request(conversation_id)?;
    let mut handle = state.orchestrator.run(request);
    let events = handle.events();
    let token = handle.cancellation_token();
    let run_id = handle.run_id();

    tracing::info!(%run_id, %conversation_id, "streaming run over SSE");

    let stream = async_stream::stream! {
        let guard = token.drop_guard();
        let mut events = std::pin::pin!(events);
        while let Some(envelope) = events.next().await {
            let terminal = envelope.event.is_terminal();
            yield Event::default()
                .event(envelope.event.kind())
                .id(envelope.seq.to_string())
                .json_data(&envelope);
            if terminal {
                break;
            }
        }
        guard.disarm();

        match handle.join().await {
            Ok(output) => tracing::debug!(
                %run_id,
                status = ?output.status,
                cost = output.total_cost,
                "run finished"
            ),
            Err(OrchestratorError::Failed { reason, .. }) => {
                tracing::debug!(%run_id, %reason, "run failed");
            }
            Err(e) => tracing::error!(%run_id, error = %e, "run task failed"),
        }
    };

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct MessageListQuery {
    /// Most recent N messages; all when absent.
    pub limit: Option<usize>,
}

/// GET /api/v1/conversations/{id}/messages
pub async fn list_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessageListQuery>,
) -> Result<ApiResponse<Vec<ConversationMessage>>, AppError> {
    let start = Instant::now();

    if state
        .conversations
        .get_conversation(&conversation_id)
        .await?
        .is_none()
    {
        return Err(AppError::NotFound(format!(
            "conversation {conversation_id} not found"
        )));
    }

    let messages = state
        .conversations
        .list_messages(&conversation_id, query.limit)
        .await?;

    Ok(ApiResponse::success(
        messages,
        Uuid::now_v7().to_string(),
        start.elapsed().as_millis() as u64,
    ))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use chorus_types::conversation::MessageAuthor;

    use super::*;
    use crate::state::tests::offline_state;

    fn body(text: &str, mode: Option<ConversationMode>) -> PostMessageRequest {
        PostMessageRequest {
            text: text.into(),
            mode,
            seed: Some(7),
            budget: None,
        }
    }

    #[tokio::test]
    async fn post_streams_events_and_persists_replies() {
        let (state, _dir) = offline_state().await;
        let id = Uuid::now_v7();

        let response = post_message(
            State(state.clone()),
            Path(id),
            Json(body("I got promoted today!", Some(ConversationMode::Fixed))),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("event: analysis_started"));
        assert!(text.contains("event: agent_chunk"));
        assert!(text.contains("event: conversation_completed"));
        let completed = text.find("event: conversation_completed").unwrap();
        let first = text.find("event: analysis_started").unwrap();
        assert!(first < completed);

        let listed = list_messages(
            State(state),
            Path(id),
            Query(MessageListQuery::default()),
        )
        .await
        .unwrap();
        let messages = listed.data.unwrap();
        assert_eq!(messages[0].role, MessageAuthor::User);
        assert!(messages[1..].iter().all(|m| m.role == MessageAuthor::Agent));
        assert_eq!(messages.len(), 4);
    }

    #[tokio::test]
    async fn empty_text_is_rejected() {
        let (state, _dir) = offline_state().await;
        let result = post_message(State(state), Path(Uuid::now_v7()), Json(body("   ", None))).await;
        let err = result.err().unwrap();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn negative_budget_is_rejected() {
        let mut request = body("hello", None);
        request.budget = Some(-1.0);
        assert!(matches!(
            request.into_run_request(Uuid::now_v7()),
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let (state, _dir) = offline_state().await;
        let result = list_messages(
            State(state),
            Path(Uuid::now_v7()),
            Query(MessageListQuery::default()),
        )
        .await;
        let err = result.err().unwrap();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }
}
