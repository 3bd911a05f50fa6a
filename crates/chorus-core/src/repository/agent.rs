//! AgentRepository trait definition.
//!
//! Persona definitions and fixed-mode flows.

use chorus_types::agent::AgentDefinition;
use chorus_types::conversation::ConversationMode;
use chorus_types::error::RepositoryError;
use chorus_types::plan::Flow;

/// Repository trait for agent definitions and flow templates.
pub trait AgentRepository: Send + Sync {
    /// List agents ordered by priority, then declared order.
    fn list_agents(
        &self,
        enabled_only: bool,
    ) -> impl std::future::Future<Output = Result<Vec<AgentDefinition>, RepositoryError>> + Send;

    /// Insert or replace an agent definition, keyed by role tag.
    fn save_agent(
        &self,
        agent: &AgentDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// The flow registered for `mode`, if any.
    fn get_flow(
        &self,
        mode: ConversationMode,
    ) -> impl std::future::Future<Output = Result<Option<Flow>, RepositoryError>> + Send;

    /// Insert or replace a flow, keyed by name.
    fn save_flow(
        &self,
        flow: &Flow,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
