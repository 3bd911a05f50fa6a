//! SQLite conversation repository implementation.
//!
//! Messages are append-only: the schema rejects UPDATEs with a trigger, and
//! this repository only ever INSERTs. Ordering within a conversation follows
//! insertion order (`rowid`), not timestamps.

use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use chorus_core::repository::ConversationRepository;
use chorus_types::conversation::{
    Conversation, ConversationMessage, ConversationMode, MessageAuthor, NewMessage,
};
use chorus_types::error::RepositoryError;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, query_error};

/// SQLite implementation of [`ConversationRepository`].
pub struct SqliteConversationRepository {
    pool: DatabasePool,
}

impl SqliteConversationRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

struct ConversationRow {
    id: String,
    mode: String,
    participants: String,
    cost_budget: f64,
    title: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ConversationRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            mode: row.try_get("mode")?,
            participants: row.try_get("participants")?,
            cost_budget: row.try_get("cost_budget")?,
            title: row.try_get("title")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_domain(self) -> Result<Conversation, RepositoryError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| RepositoryError::Query(format!("invalid conversation id: {e}")))?;
        let mode = self
            .mode
            .parse::<ConversationMode>()
            .map_err(RepositoryError::Query)?;
        let participants: Vec<String> = serde_json::from_str(&self.participants)
            .map_err(|e| RepositoryError::Query(format!("invalid participants: {e}")))?;

        Ok(Conversation {
            id,
            mode,
            participants,
            cost_budget: self.cost_budget,
            title: self.title,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct MessageRow {
    id: String,
    conversation_id: String,
    role: String,
    agent_id: Option<String>,
    stage: Option<String>,
    content: String,
    input_tokens: i64,
    output_tokens: i64,
    cost: f64,
    created_at: String,
}

impl MessageRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            conversation_id: row.try_get("conversation_id")?,
            role: row.try_get("role")?,
            agent_id: row.try_get("agent_id")?,
            stage: row.try_get("stage")?,
            content: row.try_get("content")?,
            input_tokens: row.try_get("input_tokens")?,
            output_tokens: row.try_get("output_tokens")?,
            cost: row.try_get("cost")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_domain(self) -> Result<ConversationMessage, RepositoryError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| RepositoryError::Query(format!("invalid message id: {e}")))?;
        let conversation_id = Uuid::parse_str(&self.conversation_id)
            .map_err(|e| RepositoryError::Query(format!("invalid conversation id: {e}")))?;
        let role = self
            .role
            .parse::<MessageAuthor>()
            .map_err(RepositoryError::Query)?;

        Ok(ConversationMessage {
            id,
            conversation_id,
            role,
            agent_id: self.agent_id,
            stage: self.stage,
            content: self.content,
            input_tokens: u32::try_from(self.input_tokens).unwrap_or(0),
            output_tokens: u32::try_from(self.output_tokens).unwrap_or(0),
            cost: self.cost,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

impl ConversationRepository for SqliteConversationRepository {
    async fn create_conversation(
        &self,
        conversation: &Conversation,
    ) -> Result<Conversation, RepositoryError> {
        let participants = serde_json::to_string(&conversation.participants)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query(
            "INSERT INTO conversations (id, mode, participants, cost_budget, title, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(conversation.id.to_string())
        .bind(conversation.mode.to_string())
        .bind(&participants)
        .bind(conversation.cost_budget)
        .bind(&conversation.title)
        .bind(format_datetime(&conversation.created_at))
        .bind(format_datetime(&conversation.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => RepositoryError::Conflict(
                format!("conversation {} already exists", conversation.id),
            ),
            other => query_error(other),
        })?;

        Ok(conversation.clone())
    }

    async fn get_conversation(&self, id: &Uuid) -> Result<Option<Conversation>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let conversation = ConversationRow::from_row(&row)
                    .map_err(query_error)?
                    .into_domain()?;
                Ok(Some(conversation))
            }
            None => Ok(None),
        }
    }

    async fn create_message(
        &self,
        message: NewMessage,
    ) -> Result<ConversationMessage, RepositoryError> {
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
            created_at: Utc::now(),
        };
        let created_at = format_datetime(&stored.created_at);

        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let result = sqlx::query(
            "INSERT INTO messages (id, conversation_id, role, agent_id, stage, content,
                                   input_tokens, output_tokens, cost, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(stored.id.to_string())
        .bind(stored.conversation_id.to_string())
        .bind(stored.role.to_string())
        .bind(&stored.agent_id)
        .bind(&stored.stage)
        .bind(&stored.content)
        .bind(i64::from(stored.input_tokens))
        .bind(i64::from(stored.output_tokens))
        .bind(stored.cost)
        .bind(&created_at)
        .execute(&mut *tx)
        .await;

        if let Err(e) = result {
            return Err(match e {
                sqlx::Error::Database(ref db) if db.is_foreign_key_violation() => {
                    RepositoryError::NotFound
                }
                other => query_error(other),
            });
        }

        sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(&created_at)
            .bind(stored.conversation_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;
        Ok(stored)
    }

    async fn list_messages(
        &self,
        conversation_id: &Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<ConversationMessage>, RepositoryError> {
        let limit = limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));

        // Newest `limit` rows, returned oldest first.
        let rows = sqlx::query(
            "SELECT * FROM (
                 SELECT rowid AS seq, * FROM messages
                 WHERE conversation_id = ?
                 ORDER BY rowid DESC
                 LIMIT ?
             ) ORDER BY seq ASC",
        )
        .bind(conversation_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|row| {
                MessageRow::from_row(row)
                    .map_err(query_error)?
                    .into_domain()
            })
            .collect()
    }
}
