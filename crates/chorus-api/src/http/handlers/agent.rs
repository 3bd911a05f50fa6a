//! GET /api/v1/agents

use std::time::Instant;

use axum::extract::{Query, State};
use serde::Deserialize;
use uuid::Uuid;

use chorus_core::repository::AgentRepository;
use chorus_types::agent::AgentDefinition;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct AgentListQuery {
    /// Include disabled agents.
    #[serde(default)]
    pub all: bool,
}

pub async fn list_agents(
    State(state): State<AppState>,
    Query(query): Query<AgentListQuery>,
) -> Result<ApiResponse<Vec<AgentDefinition>>, AppError> {
    let start = Instant::now();
    let agents = state.agents.list_agents(!query.all).await?;
    Ok(ApiResponse::success(
        agents,
        Uuid::now_v7().to_string(),
        start.elapsed().as_millis() as u64,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::offline_state;

    #[tokio::test]
    async fn lists_enabled_agents() {
        let (state, _dir) = offline_state().await;
        let response = list_agents(State(state), Query(AgentListQuery::default()))
            .await
            .unwrap();
        let agents = response.data.unwrap();
        assert_eq!(agents.len(), 3);
        assert_eq!(agents[0].role, "empathy");
    }
}
