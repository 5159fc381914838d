//! Tool calls and their execution path.
//!
//! A [`ToolCall`] is one invocation of a remote ServiceNow operation. It is
//! created by the session coordinator, may wait at the approval gate, and
//! is then handed to the [`RetryQueue`](queue::RetryQueue), whose single
//! worker runs it through the [`ToolExecutor`](executor::ToolExecutor).
//!
//! # Status
//!
//! ```text
//! awaiting_approval ──▶ queued ──▶ executing ──▶ completed
//!        │                │            │ ▲
//!        │                │            └─┘ retry
//!        ▼                ▼            ▼
//!      denied / error   denied / error error
//! ```
//!
//! Status never moves backwards. Retries keep a call in `executing`.
//!
//! # Naming
//!
//! Tools are shown to the model and the client under a namespaced display
//! name, `<prefix>__<tool>`, following the `mcp__server__tool` convention.
//! The prefix is stripped before the wire call and re-applied on results.

pub mod executor;
pub mod queue;

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{PilotError, PilotResult};
use crate::mcp::protocol::McpTool;
use crate::types::{MessageId, SessionId, ToolCallId};

pub use executor::{ToolExecution, ToolExecutor};
pub use queue::{QueueTicket, ResolvedCall, RetryPolicy, RetryQueue};

/// Separator between namespace and tool name.
pub const NAMESPACE_SEPARATOR: &str = "__";

/// Status of a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    AwaitingApproval,
    Queued,
    Executing,
    Completed,
    Error,
    Denied,
}

impl ToolCallStatus {
    /// Returns true once no further transition is possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Denied)
    }

    /// Returns true if moving to `next` keeps the status monotonic.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        match self {
            Self::AwaitingApproval => matches!(next, Self::Queued | Self::Denied | Self::Error),
            Self::Queued => matches!(next, Self::Executing | Self::Denied | Self::Error),
            Self::Executing => matches!(next, Self::Executing | Self::Completed | Self::Error),
            Self::Completed | Self::Error | Self::Denied => false,
        }
    }

    /// Wire name, as stored by persistence.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingApproval => "awaiting_approval",
            Self::Queued => "queued",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Denied => "denied",
        }
    }
}

impl std::fmt::Display for ToolCallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One invocation of a remote tool.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: ToolCallId,
    /// Display name (namespaced).
    pub name: String,
    pub arguments: Value,
    pub message_id: MessageId,
    pub session_id: SessionId,
    /// A failure of this call fails the whole message.
    pub required: bool,
    status: ToolCallStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<SystemTime>,
    pub ended_at: Option<SystemTime>,
    pub execution_time_ms: Option<u64>,
    pub retry_count: u32,
}

impl ToolCall {
    /// Creates a queued call.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        arguments: Value,
        message_id: MessageId,
        session_id: SessionId,
    ) -> Self {
        Self {
            id: ToolCallId::new(),
            name: name.into(),
            arguments,
            message_id,
            session_id,
            required: false,
            status: ToolCallStatus::Queued,
            result: None,
            error: None,
            started_at: None,
            ended_at: None,
            execution_time_ms: None,
            retry_count: 0,
        }
    }

    /// Marks the call as required for its message.
    #[must_use]
    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// Starts the call in the awaiting-approval state.
    #[must_use]
    pub fn pending_approval(mut self) -> Self {
        self.status = ToolCallStatus::AwaitingApproval;
        self
    }

    #[must_use]
    pub fn status(&self) -> ToolCallStatus {
        self.status
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn transition(&mut self, next: ToolCallStatus) -> PilotResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(PilotError::invalid_state(format!(
                "tool call {} cannot move from {} to {}",
                self.name, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Approval granted; the call may be queued.
    ///
    /// # Errors
    ///
    /// Returns an error unless the call is awaiting approval.
    pub fn approve(&mut self) -> PilotResult<()> {
        if self.status != ToolCallStatus::AwaitingApproval {
            return Err(PilotError::invalid_state(format!(
                "tool call {} is not awaiting approval",
                self.name
            )));
        }
        self.transition(ToolCallStatus::Queued)
    }

    /// An attempt begins. Repeated attempts keep the call executing.
    ///
    /// # Errors
    ///
    /// Returns an error if the call is not queued or executing.
    pub fn start(&mut self) -> PilotResult<()> {
        self.transition(ToolCallStatus::Executing)?;
        if self.started_at.is_none() {
            self.started_at = Some(SystemTime::now());
        }
        Ok(())
    }

    /// Records a successful result.
    ///
    /// # Errors
    ///
    /// Returns an error if the call is not executing.
    pub fn complete(&mut self, result: Value, elapsed: Duration) -> PilotResult<()> {
        self.transition(ToolCallStatus::Completed)?;
        self.result = Some(result);
        self.finish(elapsed);
        Ok(())
    }

    /// Records a terminal failure.
    ///
    /// # Errors
    ///
    /// Returns an error if the call is already terminal.
    pub fn fail(&mut self, error: impl Into<String>) -> PilotResult<()> {
        self.transition(ToolCallStatus::Error)?;
        self.error = Some(error.into());
        let elapsed = self
            .started_at
            .and_then(|start| start.elapsed().ok())
            .unwrap_or_default();
        self.finish(elapsed);
        Ok(())
    }

    /// Records a denial.
    ///
    /// # Errors
    ///
    /// Returns an error unless the call is awaiting approval or queued.
    pub fn deny(&mut self, reason: Option<String>) -> PilotResult<()> {
        self.transition(ToolCallStatus::Denied)?;
        self.error = reason;
        self.ended_at = Some(SystemTime::now());
        Ok(())
    }

    fn finish(&mut self, elapsed: Duration) {
        self.ended_at = Some(SystemTime::now());
        self.execution_time_ms = Some(elapsed.as_millis() as u64);
    }

    /// Summary included in the final message.
    #[must_use]
    pub fn summary(&self) -> ToolCallSummary {
        ToolCallSummary {
            tool_name: self.name.clone(),
            arguments: self.arguments.clone(),
            status: self.status,
            result: self.result.clone(),
            error: self.error.clone(),
            execution_time_ms: self.execution_time_ms,
        }
    }
}

/// A tool call as reported in `stream.complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallSummary {
    pub tool_name: String,
    pub arguments: Value,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
}

/// Successful output of a remote tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    /// Structured result; JSON when the tool answered with JSON text.
    pub result: Value,
    /// Raw text content.
    pub text: String,
}

impl ToolOutput {
    /// Builds an output from the tool's text content.
    #[must_use]
    pub fn from_text(text: String) -> Self {
        let result = serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text.clone()));
        Self { result, text }
    }
}

/// Maps display names to wire names and back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolNamespace {
    prefix: String,
}

impl ToolNamespace {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Strips the namespace from a display name. Names outside the
    /// namespace pass through unchanged.
    #[must_use]
    pub fn to_wire<'a>(&self, display: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            return display;
        }
        display
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix(NAMESPACE_SEPARATOR))
            .unwrap_or(display)
    }

    /// Applies the namespace to a wire name.
    #[must_use]
    pub fn to_display(&self, wire: &str) -> String {
        if self.prefix.is_empty() {
            wire.to_string()
        } else {
            format!("{}{NAMESPACE_SEPARATOR}{wire}", self.prefix)
        }
    }
}

/// A tool offered to the model, under its display name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// The tools discovered on the server.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: Vec<ToolDescriptor>,
}

impl ToolCatalog {
    /// Builds the catalog from a `tools/list` answer.
    #[must_use]
    pub fn from_mcp(tools: Vec<McpTool>, namespace: &ToolNamespace) -> Self {
        Self {
            tools: tools
                .into_iter()
                .map(|tool| ToolDescriptor {
                    name: namespace.to_display(&tool.name),
                    description: tool.description,
                    input_schema: tool.input_schema,
                })
                .collect(),
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Lifecycle notices sent while a queued call is processed.
#[derive(Debug, Clone, PartialEq)]
pub enum CallNotice {
    /// A connection was acquired and the attempt is running.
    Started { attempt: u32 },
    /// Best-effort progress of the running attempt.
    Progress(u8),
    /// The attempt failed and will be retried after `delay`.
    Retrying {
        attempt: u32,
        delay: Duration,
        error: String,
    },
}

/// Who a call belongs to and how to reach them.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub session_id: SessionId,
    pub cancel: CancellationToken,
    notices: Option<mpsc::UnboundedSender<CallNotice>>,
}

impl RequestContext {
    #[must_use]
    pub fn new(session_id: SessionId, cancel: CancellationToken) -> Self {
        Self {
            session_id,
            cancel,
            notices: None,
        }
    }

    /// Routes lifecycle notices to `tx`.
    #[must_use]
    pub fn with_notices(mut self, tx: mpsc::UnboundedSender<CallNotice>) -> Self {
        self.notices = Some(tx);
        self
    }

    pub fn notify(&self, notice: CallNotice) {
        if let Some(tx) = &self.notices {
            let _ = tx.send(notice);
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
