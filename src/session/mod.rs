//! Streaming sessions.
//!
//! A [`StreamingSession`] tracks one user message from receipt to final
//! answer. Its phase only moves forward:
//!
//! ```text
//! thinking ──▶ tool_execution ──▶ responding ──▶ complete
//!     │              │                 │
//!     └──────────────┴─────────────────┴──▶ error
//! ```
//!
//! `thinking` may go straight to `responding` when no tool is selected.
//! [`SessionCoordinator`](coordinator::SessionCoordinator) drives the
//! transitions and emits the matching protocol events.

pub mod coordinator;

use serde::Serialize;

use crate::error::{PilotError, PilotResult};
use crate::tools::{ToolCall, ToolCallSummary};
use crate::types::{FinalMessage, MessageId, SessionId};

pub use coordinator::{SessionCoordinator, SessionOutcome, Turn};

/// Phase of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Thinking,
    ToolExecution,
    Responding,
    Complete,
    Error,
}

impl SessionPhase {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// Returns true if `next` is a valid forward step.
    #[must_use]
    pub const fn can_advance_to(&self, next: Self) -> bool {
        match self {
            Self::Thinking => matches!(next, Self::ToolExecution | Self::Responding | Self::Error),
            Self::ToolExecution => matches!(next, Self::Responding | Self::Error),
            Self::Responding => matches!(next, Self::Complete | Self::Error),
            Self::Complete | Self::Error => false,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Thinking => "thinking",
            Self::ToolExecution => "tool_execution",
            Self::Responding => "responding",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-side state of one in-flight user message.
#[derive(Debug)]
pub struct StreamingSession {
    /// Id the client sees on every event of this message.
    pub message_id: MessageId,
    pub session_id: SessionId,
    pub model: String,
    /// Row of the assistant message in the chat store, once created.
    pub record_id: Option<MessageId>,
    phase: SessionPhase,
    text: String,
    tool_calls: Vec<ToolCall>,
    degraded: bool,
}

impl StreamingSession {
    #[must_use]
    pub fn new(message_id: MessageId, session_id: SessionId, model: impl Into<String>) -> Self {
        Self {
            message_id,
            session_id,
            model: model.into(),
            record_id: None,
            phase: SessionPhase::Thinking,
            text: String::new(),
            tool_calls: Vec::new(),
            degraded: false,
        }
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Moves to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`PilotError::InvalidState`] for a backward or skipped step.
    pub fn advance(&mut self, next: SessionPhase) -> PilotResult<()> {
        if !self.phase.can_advance_to(next) {
            return Err(PilotError::invalid_state(format!(
                "session {} cannot move from {} to {}",
                self.message_id, self.phase, next
            )));
        }
        self.phase = next;
        Ok(())
    }

    /// Moves to `error` unless already terminal. Returns true if it moved.
    pub fn fail(&mut self) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        self.phase = SessionPhase::Error;
        true
    }

    pub fn push_text(&mut self, chunk: &str) {
        self.text.push_str(chunk);
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Appends a resolved tool call.
    pub fn record_tool(&mut self, call: ToolCall) {
        self.tool_calls.push(call);
    }

    #[must_use]
    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.tool_calls
    }

    #[must_use]
    pub fn summaries(&self) -> Vec<ToolCallSummary> {
        self.tool_calls.iter().map(ToolCall::summary).collect()
    }

    /// Flags that some of the session could not be persisted.
    pub fn mark_degraded(&mut self) {
        self.degraded = true;
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// The message delivered with `stream.complete`.
    #[must_use]
    pub fn final_message(&self) -> FinalMessage {
        FinalMessage {
            content: self.text.clone(),
            tool_calls: self.summaries(),
            model: self.model.clone(),
        }
    }
}
