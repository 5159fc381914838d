//! Language model collaborators.
//!
//! The session coordinator talks to the model through two seams:
//!
//! - [`ToolSelector`] decides which tools to run for a user message.
//! - [`TextGenerator`] streams the assistant's answer, given the
//!   conversation and the results of the tools that ran.
//!
//! [`AnthropicClient`] implements both against the Messages API. Tests
//! substitute scripted implementations.

pub mod anthropic;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::PilotResult;
use crate::tools::{ToolCallSummary, ToolDescriptor};
use crate::types::ContextMessage;

pub use anthropic::AnthropicClient;

/// Input for the planning step.
#[derive(Debug, Clone)]
pub struct SelectionRequest {
    pub model: String,
    /// Earlier messages of the conversation, oldest first.
    pub context: Vec<ContextMessage>,
    pub user_text: String,
    /// Tools the model may choose from, under their display names.
    pub tools: Vec<ToolDescriptor>,
    /// Upper bound on planned calls.
    pub max_tools: usize,
}

/// One tool call chosen by the selector.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedTool {
    /// Display name.
    pub name: String,
    pub arguments: Value,
    /// A failure of this call fails the whole message.
    pub required: bool,
}

impl PlannedTool {
    #[must_use]
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
            required: false,
        }
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Input for the responding step.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: String,
    pub context: Vec<ContextMessage>,
    pub user_text: String,
    /// Outcome of every tool call made for this message, in order.
    pub tool_results: Vec<ToolCallSummary>,
}

impl GenerationRequest {
    /// The user turn as sent to the model, with tool outcomes appended.
    #[must_use]
    pub fn user_turn(&self) -> String {
        if self.tool_results.is_empty() {
            return self.user_text.clone();
        }

        let mut turn = self.user_text.clone();
        turn.push_str("\n\nTool results:\n");
        for summary in &self.tool_results {
            let outcome = match (&summary.result, &summary.error) {
                (Some(result), _) => result.to_string(),
                (None, Some(error)) => format!("{}: {error}", summary.status),
                (None, None) => summary.status.to_string(),
            };
            turn.push_str(&format!("- {} ({}): {outcome}\n", summary.tool_name, summary.status));
        }
        turn
    }
}

/// Plans tool calls for a user message.
#[async_trait]
pub trait ToolSelector: Send + Sync {
    /// Returns zero or more calls, in the order they should run.
    async fn select(&self, request: &SelectionRequest) -> PilotResult<Vec<PlannedTool>>;
}

/// Streams the assistant's answer.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Sends text fragments to `chunks` as they arrive.
    ///
    /// Returns once the answer is complete. A closed `chunks` receiver
    /// ends generation early without an error.
    async fn stream_reply(
        &self,
        request: &GenerationRequest,
        chunks: mpsc::Sender<String>,
    ) -> PilotResult<()>;
}
