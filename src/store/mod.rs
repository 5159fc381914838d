//! Chat history persistence.
//!
//! The orchestrator records messages and tool executions through the
//! [`ChatStore`] trait and reads recent messages back as model context.
//! The relational store used in production lives outside this crate;
//! [`MemoryStore`] keeps everything in process and backs the default
//! binary and the tests.

use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{PilotError, PilotResult};
use crate::tools::ToolCallStatus;
use crate::types::{ExecutionId, MessageId, Role, SessionId, StoredMessage};

/// Fields written when a tool execution changes status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionUpdate {
    pub status: ToolCallStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub execution_time_ms: Option<u64>,
}

/// A recorded tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredToolExecution {
    pub id: ExecutionId,
    pub message_id: MessageId,
    pub tool_name: String,
    pub arguments: Value,
    pub status: ToolCallStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub execution_time_ms: Option<u64>,
    pub created_at: SystemTime,
}

/// Persistence consumed by the session coordinator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Records a message and returns its id.
    async fn create_message(
        &self,
        session_id: &SessionId,
        role: Role,
        content: &str,
    ) -> PilotResult<MessageId>;

    /// Replaces a message's content.
    async fn update_message_content(&self, id: &MessageId, content: &str) -> PilotResult<()>;

    /// Records a tool execution for a message and returns its id.
    async fn create_tool_execution(
        &self,
        message_id: &MessageId,
        tool_name: &str,
        arguments: &Value,
    ) -> PilotResult<ExecutionId>;

    /// Writes a status change of a tool execution.
    async fn update_tool_execution(
        &self,
        id: &ExecutionId,
        update: ToolExecutionUpdate,
    ) -> PilotResult<()>;

    /// Returns up to `limit` most recent messages, oldest first.
    async fn list_recent_messages(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> PilotResult<Vec<StoredMessage>>;
}

#[derive(Default)]
struct MemoryState {
    messages: Vec<StoredMessage>,
    executions: Vec<StoredToolExecution>,
}

/// In-process [`ChatStore`].
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages of a conversation, oldest first.
    pub async fn messages(&self, session_id: &SessionId) -> Vec<StoredMessage> {
        self.state
            .read()
            .await
            .messages
            .iter()
            .filter(|m| &m.session_id == session_id)
            .cloned()
            .collect()
    }

    /// All tool executions recorded for a message, in creation order.
    pub async fn executions(&self, message_id: &MessageId) -> Vec<StoredToolExecution> {
        self.state
            .read()
            .await
            .executions
            .iter()
            .filter(|e| &e.message_id == message_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn create_message(
        &self,
        session_id: &SessionId,
        role: Role,
        content: &str,
    ) -> PilotResult<MessageId> {
        let id = MessageId::new();
        self.state.write().await.messages.push(StoredMessage {
            id: id.clone(),
            session_id: session_id.clone(),
            role,
            content: content.to_string(),
            created_at: SystemTime::now(),
        });
        Ok(id)
    }

    async fn update_message_content(&self, id: &MessageId, content: &str) -> PilotResult<()> {
        let mut state = self.state.write().await;
        let message = state
            .messages
            .iter_mut()
            .find(|m| &m.id == id)
            .ok_or_else(|| PilotError::not_found("message", id.as_str()))?;
        message.content = content.to_string();
        Ok(())
    }

    async fn create_tool_execution(
        &self,
        message_id: &MessageId,
        tool_name: &str,
        arguments: &Value,
    ) -> PilotResult<ExecutionId> {
        let id = ExecutionId::new();
        self.state.write().await.executions.push(StoredToolExecution {
            id: id.clone(),
            message_id: message_id.clone(),
            tool_name: tool_name.to_string(),
            arguments: arguments.clone(),
            status: ToolCallStatus::Queued,
            result: None,
            error: None,
            execution_time_ms: None,
            created_at: SystemTime::now(),
        });
        Ok(id)
    }

    async fn update_tool_execution(
        &self,
        id: &ExecutionId,
        update: ToolExecutionUpdate,
    ) -> PilotResult<()> {
        let mut state = self.state.write().await;
        let execution = state
            .executions
            .iter_mut()
            .find(|e| &e.id == id)
            .ok_or_else(|| PilotError::not_found("tool execution", id.as_str()))?;
        execution.status = update.status;
        execution.result = update.result;
        execution.error = update.error;
        execution.execution_time_ms = update.execution_time_ms;
        Ok(())
    }

    async fn list_recent_messages(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> PilotResult<Vec<StoredMessage>> {
        let state = self.state.read().await;
        let mut recent: Vec<_> = state
            .messages
            .iter()
            .rev()
            .filter(|m| &m.session_id == session_id)
            .take(limit)
            .cloned()
            .collect();
        recent.reverse();
        Ok(recent)
    }
}
