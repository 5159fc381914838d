//! Human approval for sensitive tool calls.
//!
//! Each conversation owns one [`ApprovalGate`]. A call whose display name
//! matches the [`ApprovalPolicy`] waits at the gate until the user answers
//! the `tool.approval_required` prompt; the call never reaches the retry
//! queue before that.
//!
//! # Flow
//!
//! ```text
//! ApprovalGate::check(call)
//!     ├─ policy does not match → Allowed
//!     ├─ tool in always-allow set → Allowed
//!     └─ otherwise → wait for respond(id, ...)
//!            ├─ approved          → ApprovedOnce
//!            ├─ approved, always  → ApprovedAlways (tool added to the set)
//!            └─ denied            → Denied { reason }
//! ```
//!
//! Only one prompt is outstanding per conversation. Further requests wait
//! in FIFO order and are prompted one after another. When a tool becomes
//! always-allowed, its waiting requests are released without a prompt.

pub mod patterns;

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::error::{PilotError, PilotResult};
use crate::tools::ToolCall;
use crate::types::config::ApprovalSettings;
use crate::types::{ApprovalId, EventSink, MessageId, ServerEvent};

use patterns::matches_any;

/// Which tools need approval.
#[derive(Debug, Clone, Default)]
pub struct ApprovalPolicy {
    required: Vec<String>,
}

impl ApprovalPolicy {
    /// Creates a policy from glob patterns over display tool names.
    #[must_use]
    pub fn new(required: Vec<String>) -> Self {
        Self { required }
    }

    #[must_use]
    pub fn requires_approval(&self, tool_name: &str) -> bool {
        matches_any(&self.required, tool_name)
    }
}

impl From<&ApprovalSettings> for ApprovalPolicy {
    fn from(settings: &ApprovalSettings) -> Self {
        Self::new(settings.required.clone())
    }
}

/// Outcome of passing a call through the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    /// No prompt was needed.
    Allowed,
    /// The user approved this call.
    ApprovedOnce,
    /// The user approved this call and every later call of the same tool.
    ApprovedAlways,
    /// The user denied the call.
    Denied { reason: Option<String> },
    /// The request was withdrawn before the user answered.
    Withdrawn,
}

/// A request waiting for the user.
struct ApprovalRequest {
    id: ApprovalId,
    tool_name: String,
    description: String,
    arguments: Value,
    message_id: MessageId,
    sink: EventSink,
    responder: oneshot::Sender<ApprovalDecision>,
}

impl ApprovalRequest {
    fn prompt(&self) {
        self.sink.emit(ServerEvent::ApprovalRequired {
            id: self.id.clone(),
            tool_name: self.tool_name.clone(),
            description: self.description.clone(),
            arguments: self.arguments.clone(),
        });
    }

    fn decide(self, decision: ApprovalDecision) {
        let _ = self.responder.send(decision);
    }
}

#[derive(Default)]
struct GateState {
    outstanding: Option<ApprovalRequest>,
    waiting: VecDeque<ApprovalRequest>,
    always_allow: HashSet<String>,
}

impl GateState {
    /// Prompts the next waiting request, releasing always-allowed ones.
    fn promote(&mut self) {
        while self.outstanding.is_none() {
            let Some(next) = self.waiting.pop_front() else {
                return;
            };
            if self.always_allow.contains(&next.tool_name) {
                next.decide(ApprovalDecision::Allowed);
            } else {
                next.prompt();
                self.outstanding = Some(next);
            }
        }
    }
}

/// Per-conversation approval gate.
pub struct ApprovalGate {
    policy: ApprovalPolicy,
    state: Mutex<GateState>,
}

impl ApprovalGate {
    #[must_use]
    pub fn new(policy: ApprovalPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(GateState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Returns true if `call` would wait for the user right now.
    #[must_use]
    pub fn needs_approval(&self, tool_name: &str) -> bool {
        self.policy.requires_approval(tool_name) && !self.is_always_allowed(tool_name)
    }

    #[must_use]
    pub fn is_always_allowed(&self, tool_name: &str) -> bool {
        self.state().always_allow.contains(tool_name)
    }

    /// Passes `call` through the gate, prompting the user via `sink` when
    /// needed, and waits for the decision.
    pub async fn check(
        &self,
        call: &ToolCall,
        description: &str,
        sink: &EventSink,
    ) -> ApprovalDecision {
        if !self.policy.requires_approval(&call.name) {
            return ApprovalDecision::Allowed;
        }

        let rx = {
            let mut state = self.state();
            if state.always_allow.contains(&call.name) {
                debug!(tool = %call.name, "Tool is always allowed in this conversation");
                return ApprovalDecision::Allowed;
            }

            let (tx, rx) = oneshot::channel();
            let request = ApprovalRequest {
                id: ApprovalId::new(),
                tool_name: call.name.clone(),
                description: description.to_string(),
                arguments: call.arguments.clone(),
                message_id: call.message_id.clone(),
                sink: sink.clone(),
                responder: tx,
            };
            info!(tool = %call.name, approval = %request.id, "Approval required");
            state.waiting.push_back(request);
            state.promote();
            rx
        };

        rx.await.unwrap_or(ApprovalDecision::Withdrawn)
    }

    /// Answers the outstanding prompt.
    ///
    /// # Errors
    ///
    /// Returns [`PilotError::NotFound`] if `id` is not the outstanding
    /// prompt (unknown, stale, or already answered).
    pub fn respond(
        &self,
        id: &ApprovalId,
        approved: bool,
        always: bool,
        reason: Option<String>,
    ) -> PilotResult<ApprovalDecision> {
        let mut state = self.state();
        let matches = state.outstanding.as_ref().is_some_and(|req| &req.id == id);
        let Some(request) = state.outstanding.take().filter(|_| matches) else {
            return Err(PilotError::not_found("approval", id.as_str()));
        };

        let decision = match (approved, always) {
            (false, _) => ApprovalDecision::Denied { reason },
            (true, false) => ApprovalDecision::ApprovedOnce,
            (true, true) => {
                state.always_allow.insert(request.tool_name.clone());
                let tool = request.tool_name.clone();
                let (released, kept): (VecDeque<_>, VecDeque<_>) = state
                    .waiting
                    .drain(..)
                    .partition(|waiter| waiter.tool_name == tool);
                state.waiting = kept;
                for waiter in released {
                    waiter.decide(ApprovalDecision::Allowed);
                }
                ApprovalDecision::ApprovedAlways
            }
        };

        info!(tool = %request.tool_name, approval = %id, ?decision, "Approval answered");
        request.decide(decision.clone());
        state.promote();
        Ok(decision)
    }

    /// Withdraws every request of one message.
    pub fn cancel_message(&self, message_id: &MessageId) -> usize {
        let mut state = self.state();
        let (withdrawn, kept): (VecDeque<_>, VecDeque<_>) = state
            .waiting
            .drain(..)
            .partition(|req| &req.message_id == message_id);
        state.waiting = kept;

        let mut count = withdrawn.len();
        for req in withdrawn {
            req.decide(ApprovalDecision::Withdrawn);
        }

        let outstanding_matches = state
            .outstanding
            .as_ref()
            .is_some_and(|req| &req.message_id == message_id);
        if outstanding_matches {
            if let Some(req) = state.outstanding.take() {
                req.decide(ApprovalDecision::Withdrawn);
                count += 1;
            }
        }

        state.promote();
        count
    }

    /// Withdraws every request.
    pub fn cancel_all(&self) -> usize {
        let mut state = self.state();
        let mut count = 0;
        if let Some(req) = state.outstanding.take() {
            req.decide(ApprovalDecision::Withdrawn);
            count += 1;
        }
        for req in state.waiting.drain(..) {
            req.decide(ApprovalDecision::Withdrawn);
            count += 1;
        }
        count
    }

    /// The prompt currently shown to the user, if any.
    #[must_use]
    pub fn outstanding(&self) -> Option<ApprovalId> {
        self.state().outstanding.as_ref().map(|req| req.id.clone())
    }

    /// Requests waiting behind the outstanding prompt.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.state().waiting.len()
    }
}
