//! Conversation messages as the chat store sees them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

use super::ids::{MessageId, SessionId};

/// Represents a participant role in a conversation.
///
/// Roles are serialized as lowercase strings, matching the language model API.
///
/// ```
/// use nowpilot::types::message::Role;
///
/// assert_eq!(Role::Assistant.to_string(), "assistant");
/// assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Human user sending messages
    User,
    /// The assistant answering them
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// A message row returned by the chat store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Store-assigned identifier.
    pub id: MessageId,
    /// Conversation the message belongs to.
    pub session_id: SessionId,
    /// Who wrote it.
    pub role: Role,
    /// Message text.
    pub content: String,
    /// When the row was created.
    pub created_at: SystemTime,
}

/// A message handed to the language model as context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMessage {
    /// Who wrote it.
    pub role: Role,
    /// Message text.
    pub content: String,
}

impl ContextMessage {
    /// Creates a user context message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Creates an assistant context message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

impl From<&StoredMessage> for ContextMessage {
    fn from(message: &StoredMessage) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
        }
    }
}
