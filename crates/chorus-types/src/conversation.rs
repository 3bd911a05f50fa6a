//! Conversation and message types for Chorus.
//!
//! A conversation owns an append-only sequence of messages. Messages are
//! never mutated once persisted; the orchestrator only ever creates them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::fmt;
use std::str::FromStr;

/// How the scheduler builds plans for a conversation.
///
/// Maps to the CHECK constraint in the SQLite schema:
/// `CHECK (mode IN ('fixed', 'dynamic', 'natural', 'smart'))`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationMode {
    /// Ordered role list from a named flow.
    Fixed,
    /// Recommended agents, ordered by priority.
    #[default]
    Dynamic,
    /// Participant set in a seeded random order.
    Natural,
    /// Dynamic selection re-evaluated after every stage.
    Smart,
}

impl fmt::Display for ConversationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationMode::Fixed => write!(f, "fixed"),
            ConversationMode::Dynamic => write!(f, "dynamic"),
            ConversationMode::Natural => write!(f, "natural"),
            ConversationMode::Smart => write!(f, "smart"),
        }
    }
}

impl FromStr for ConversationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed" => Ok(ConversationMode::Fixed),
            "dynamic" => Ok(ConversationMode::Dynamic),
            "natural" => Ok(ConversationMode::Natural),
            "smart" => Ok(ConversationMode::Smart),
            other => Err(format!("invalid conversation mode: '{other}'")),
        }
    }
}

/// A multi-agent conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub mode: ConversationMode,
    /// Role tags of the agents taking part. Empty means every enabled agent.
    pub participants: Vec<String>,
    /// Maximum cost, in cost units, a single run may spend.
    pub cost_budget: f64,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageAuthor {
    User,
    Agent,
}

impl fmt::Display for MessageAuthor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageAuthor::User => write!(f, "user"),
            MessageAuthor::Agent => write!(f, "agent"),
        }
    }
}

impl FromStr for MessageAuthor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(MessageAuthor::User),
            "agent" => Ok(MessageAuthor::Agent),
            other => Err(format!("invalid message author: '{other}'")),
        }
    }
}

/// A persisted, immutable message within a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageAuthor,
    /// Role tag of the authoring agent; `None` for user messages.
    pub agent_id: Option<String>,
    /// Name of the plan stage that produced this message.
    pub stage: Option<String>,
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
}

/// Everything needed to append a message; the store assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub role: MessageAuthor,
    pub agent_id: Option<String>,
    pub stage: Option<String>,
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost: f64,
}

impl NewMessage {
    /// A user-authored message with no usage attached.
    pub fn user(conversation_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            role: MessageAuthor::User,
            agent_id: None,
            stage: None,
            content: content.into(),
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
        }
    }
}
