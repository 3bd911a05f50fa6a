//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (chorus-infra) implements. The core crate never depends on any specific
//! storage technology; [`memory::InMemoryStore`] backs tests and dry runs.

pub mod agent;
pub mod conversation;
pub mod memory;

pub use agent::AgentRepository;
pub use conversation::ConversationRepository;
