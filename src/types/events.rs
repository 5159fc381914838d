//! Wire protocol between the browser client and the orchestrator.
//!
//! Frames are JSON text messages tagged by `type`, with camelCase payload
//! fields:
//!
//! ```json
//! {"type": "message.submit", "text": "create an incident", "model": null}
//! {"type": "tool.start", "messageId": "…", "toolName": "servicenow__create_incident", "arguments": {}}
//! ```
//!
//! # Event Order
//!
//! For one user message the client observes:
//!
//! ```text
//! stream.start → stream.thinking → (tool.approval_required? tool.start tool.progress* (tool.complete | tool.error) | tool.denied)*
//!              → text.chunk* → (stream.complete | stream.error)
//! ```
//!
//! `stream.error` may replace the tail of that sequence at any point.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use super::ids::{ApprovalId, MessageId, SessionId};
use crate::tools::ToolCallSummary;

/// Messages sent by the browser client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// A new user message.
    #[serde(rename = "message.submit")]
    Submit {
        /// The user's text.
        text: String,
        /// Model override for this message.
        #[serde(default)]
        model: Option<String>,
        /// Conversation to continue; a new one is created when absent.
        #[serde(default)]
        session_id: Option<SessionId>,
    },

    /// The user's answer to a `tool.approval_required` prompt.
    #[serde(rename = "tool.approval_response")]
    ApprovalResponse {
        /// The approval prompt being answered.
        id: ApprovalId,
        /// Whether the call may run.
        approved: bool,
        /// Remember the approval for this tool for the rest of the conversation.
        #[serde(default)]
        always: bool,
        /// Optional reason for a denial.
        #[serde(default)]
        reason: Option<String>,
    },

    /// Stop an in-flight message.
    #[serde(rename = "stream.cancel")]
    Cancel {
        /// The message to stop.
        message_id: MessageId,
    },
}

/// The assistant message delivered with `stream.complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalMessage {
    /// Full response text.
    pub content: String,
    /// Every tool call made for this message, in execution order.
    pub tool_calls: Vec<ToolCallSummary>,
    /// Model that produced the text.
    pub model: String,
}

/// Events sent to the browser client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// A conversation was created for a submit without `sessionId`.
    #[serde(rename = "session.ready")]
    SessionReady { session_id: SessionId },

    /// Processing of a user message has started.
    #[serde(rename = "stream.start")]
    StreamStart { message_id: MessageId },

    /// The assistant is deciding which tools to use.
    #[serde(rename = "stream.thinking")]
    StreamThinking { message_id: MessageId },

    /// A tool call needs the user's approval before it can run.
    #[serde(rename = "tool.approval_required")]
    ApprovalRequired {
        id: ApprovalId,
        tool_name: String,
        description: String,
        arguments: Value,
    },

    /// A tool call acquired a connection and is running.
    #[serde(rename = "tool.start")]
    ToolStart {
        message_id: MessageId,
        tool_name: String,
        arguments: Value,
    },

    /// Best-effort progress of a running tool call (0..=100).
    #[serde(rename = "tool.progress")]
    ToolProgress {
        message_id: MessageId,
        tool_name: String,
        progress: u8,
    },

    /// A tool call finished successfully.
    #[serde(rename = "tool.complete")]
    ToolComplete {
        message_id: MessageId,
        tool_name: String,
        result: Value,
        execution_time_ms: u64,
    },

    /// A tool call failed.
    #[serde(rename = "tool.error")]
    ToolError {
        message_id: MessageId,
        tool_name: String,
        error: String,
    },

    /// The user denied a tool call.
    #[serde(rename = "tool.denied")]
    ToolDenied {
        message_id: MessageId,
        tool_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// A fragment of the assistant's text.
    #[serde(rename = "text.chunk")]
    TextChunk { message_id: MessageId, chunk: String },

    /// The message is complete.
    #[serde(rename = "stream.complete")]
    StreamComplete {
        message_id: MessageId,
        message: FinalMessage,
    },

    /// The message failed.
    #[serde(rename = "stream.error")]
    StreamError { message_id: MessageId, error: String },

    /// The submit was rejected by the rate limiter.
    #[serde(rename = "rate_limited")]
    RateLimited { retry_after_ms: u64 },

    /// A client frame could not be handled.
    #[serde(rename = "error")]
    Error { error: String },
}

impl ServerEvent {
    /// Returns the wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionReady { .. } => "session.ready",
            Self::StreamStart { .. } => "stream.start",
            Self::StreamThinking { .. } => "stream.thinking",
            Self::ApprovalRequired { .. } => "tool.approval_required",
            Self::ToolStart { .. } => "tool.start",
            Self::ToolProgress { .. } => "tool.progress",
            Self::ToolComplete { .. } => "tool.complete",
            Self::ToolError { .. } => "tool.error",
            Self::ToolDenied { .. } => "tool.denied",
            Self::TextChunk { .. } => "text.chunk",
            Self::StreamComplete { .. } => "stream.complete",
            Self::StreamError { .. } => "stream.error",
            Self::RateLimited { .. } => "rate_limited",
            Self::Error { .. } => "error",
        }
    }

    /// Returns the message this event belongs to, if any.
    #[must_use]
    pub fn message_id(&self) -> Option<&MessageId> {
        match self {
            Self::StreamStart { message_id }
            | Self::StreamThinking { message_id }
            | Self::ToolStart { message_id, .. }
            | Self::ToolProgress { message_id, .. }
            | Self::ToolComplete { message_id, .. }
            | Self::ToolError { message_id, .. }
            | Self::ToolDenied { message_id, .. }
            | Self::TextChunk { message_id, .. }
            | Self::StreamComplete { message_id, .. }
            | Self::StreamError { message_id, .. } => Some(message_id),
            Self::SessionReady { .. }
            | Self::ApprovalRequired { .. }
            | Self::RateLimited { .. }
            | Self::Error { .. } => None,
        }
    }

    /// Returns true for `stream.complete` and `stream.error`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::StreamComplete { .. } | Self::StreamError { .. })
    }
}

/// Outbound half of a client channel.
///
/// Emission never blocks and never fails loudly: a client that went away
/// simply stops receiving events, and the session notices through its
/// cancellation token instead.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl EventSink {
    /// Creates a sink and the receiver that drains it.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Sends an event. Returns false if the client is gone.
    pub fn emit(&self, event: ServerEvent) -> bool {
        let name = event.name();
        let delivered = self.tx.send(event).is_ok();
        if !delivered {
            tracing::debug!(event = name, "Client channel closed, event dropped");
        }
        delivered
    }

    /// Returns true if the receiving side has been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
