//! ConversationRepository trait definition.
//!
//! Conversations are created on the first user message; messages are
//! append-only and never updated once written.

use chorus_types::conversation::{Conversation, ConversationMessage, NewMessage};
use chorus_types::error::RepositoryError;
use uuid::Uuid;

/// Repository trait for conversation and message persistence.
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition).
pub trait ConversationRepository: Send + Sync {
    /// Create a new conversation.
    fn create_conversation(
        &self,
        conversation: &Conversation,
    ) -> impl std::future::Future<Output = Result<Conversation, RepositoryError>> + Send;

    /// Get a conversation by its unique ID.
    fn get_conversation(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Conversation>, RepositoryError>> + Send;

    /// Append an immutable message, returning it with its assigned id and timestamp.
    fn create_message(
        &self,
        message: NewMessage,
    ) -> impl std::future::Future<Output = Result<ConversationMessage, RepositoryError>> + Send;

    /// The most recent `limit` messages (all when `None`), in chronological order.
    fn list_messages(
        &self,
        conversation_id: &Uuid,
        limit: Option<usize>,
    ) -> impl std::future::Future<Output = Result<Vec<ConversationMessage>, RepositoryError>> + Send;
}
