//! In-memory implementation of both repository ports.
//!
//! Cheap to clone (all state behind one `Arc`). Used by engine tests and
//! by the config seeding tests.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use chorus_types::agent::AgentDefinition;
use chorus_types::conversation::{Conversation, ConversationMessage, ConversationMode, NewMessage};
use chorus_types::error::RepositoryError;
use chorus_types::plan::Flow;

use super::agent::AgentRepository;
use super::conversation::ConversationRepository;

#[derive(Default)]
struct State {
    conversations: HashMap<Uuid, Conversation>,
    messages: HashMap<Uuid, Vec<ConversationMessage>>,
    agents: Vec<AgentDefinition>,
    flows: Vec<Flow>,
}

/// Volatile store for conversations, messages, agents, and flows.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with agents and flows.
    pub fn with_seed(agents: Vec<AgentDefinition>, flows: Vec<Flow>) -> Self {
        Self {
            state: Arc::new(RwLock::new(State {
                agents,
                flows,
                ..State::default()
            })),
        }
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore").finish_non_exhaustive()
    }
}

impl ConversationRepository for InMemoryStore {
    async fn create_conversation(
        &self,
        conversation: &Conversation,
    ) -> Result<Conversation, RepositoryError> {
        let mut state = self.state.write().await;
        if state.conversations.contains_key(&conversation.id) {
            return Err(RepositoryError::Conflict(format!(
                "conversation {} already exists",
                conversation.id
            )));
        }
        state
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(conversation.clone())
    }

    async fn get_conversation(&self, id: &Uuid) -> Result<Option<Conversation>, RepositoryError> {
        Ok(self.state.read().await.conversations.get(id).cloned())
    }

    async fn create_message(
        &self,
        message: NewMessage,
    ) -> Result<ConversationMessage, RepositoryError> {
        let mut state = self.state.write().await;
        let conversation = state
            .conversations
            .get_mut(&message.conversation_id)
            .ok_or(RepositoryError::NotFound)?;
        let now = Utc::now();
        conversation.updated_at = now;

        let stored = ConversationMessage {
            id: Uuid::now_v7(),
            conversation_id: message.conversation_id,
            role: message.role,
            agent_id: message.agent_id,
            stage: message.stage,
            content: message.content,
            input_tokens: message.input_tokens,
            output_tokens: message.output_tokens,
            cost: message.cost,
            created_at: now,
        };
        state
            .messages
            .entry(stored.conversation_id)
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    async fn list_messages(
        &self,
        conversation_id: &Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<ConversationMessage>, RepositoryError> {
        let state = self.state.read().await;
        let all = state
            .messages
            .get(conversation_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[]);
        let start = limit.map_or(0, |l| all.len().saturating_sub(l));
        Ok(all[start..].to_vec())
    }
}

impl AgentRepository for InMemoryStore {
    async fn list_agents(&self, enabled_only: bool) -> Result<Vec<AgentDefinition>, RepositoryError> {
        let state = self.state.read().await;
        let mut agents: Vec<AgentDefinition> = state
            .agents
            .iter()
            .filter(|a| !enabled_only || a.enabled)
            .cloned()
            .collect();
        agents.sort_by_key(|a| a.rank());
        Ok(agents)
    }

    async fn save_agent(&self, agent: &AgentDefinition) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        match state.agents.iter_mut().find(|a| a.role == agent.role) {
            Some(existing) => *existing = agent.clone(),
            None => state.agents.push(agent.clone()),
        }
        Ok(())
    }

    async fn get_flow(&self, mode: ConversationMode) -> Result<Option<Flow>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.flows.iter().find(|f| f.mode == mode).cloned())
    }

    async fn save_flow(&self, flow: &Flow) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        match state.flows.iter_mut().find(|f| f.name == flow.name) {
            Some(existing) => *existing = flow.clone(),
            None => state.flows.push(flow.clone()),
        }
        Ok(())
    }
}
