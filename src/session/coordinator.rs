//! Drives one user message through its phases.
//!
//! ```text
//! stream.start, stream.thinking       selector.select()
//! for each planned call, in order:    gate.check() → queue.submit() → ticket.wait()
//!                                     tool.start / tool.progress / tool.complete | tool.error | tool.denied
//! text.chunk*                         generator.stream_reply()
//! stream.complete | stream.error
//! ```
//!
//! Tool calls of one message run strictly one after another. Cancellation
//! is cooperative: a queued call is withdrawn, a running call is given the
//! executor's grace period, and the session ends with `stream.error`.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{SessionPhase, StreamingSession};
use crate::api::{GenerationRequest, PlannedTool, SelectionRequest, TextGenerator, ToolSelector};
use crate::approval::{ApprovalDecision, ApprovalGate};
use crate::error::{PilotError, PilotResult};
use crate::store::{ChatStore, ToolExecutionUpdate};
use crate::tools::{
    CallNotice, RequestContext, ResolvedCall, RetryQueue, ToolCall, ToolCallStatus, ToolCatalog,
};
use crate::types::{ContextMessage, EventSink, ExecutionId, MessageId, Role, ServerEvent, SessionId};

/// A user message to process.
#[derive(Debug, Clone)]
pub struct Turn {
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub text: String,
    pub model: String,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// `stream.complete` was sent. `degraded` is set when something could
    /// not be persisted.
    Completed { degraded: bool },
    /// `stream.error` was sent.
    Failed { error: String },
    /// The session was cancelled before completing.
    Cancelled,
}

impl SessionOutcome {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// Short label for logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Runs streaming sessions against the shared queue and collaborators.
#[derive(Clone)]
pub struct SessionCoordinator {
    queue: Arc<RetryQueue>,
    selector: Arc<dyn ToolSelector>,
    generator: Arc<dyn TextGenerator>,
    store: Arc<dyn ChatStore>,
    catalog: Arc<ToolCatalog>,
    context_messages: usize,
    max_tools: usize,
}

impl SessionCoordinator {
    #[must_use]
    pub fn new(
        queue: Arc<RetryQueue>,
        selector: Arc<dyn ToolSelector>,
        generator: Arc<dyn TextGenerator>,
        store: Arc<dyn ChatStore>,
        catalog: Arc<ToolCatalog>,
    ) -> Self {
        Self {
            queue,
            selector,
            generator,
            store,
            catalog,
            context_messages: 10,
            max_tools: 4,
        }
    }

    /// Previous messages loaded as model context.
    #[must_use]
    pub fn with_context_messages(mut self, count: usize) -> Self {
        self.context_messages = count;
        self
    }

    /// Upper bound on tool calls per message.
    #[must_use]
    pub fn with_max_tools(mut self, count: usize) -> Self {
        self.max_tools = count;
        self
    }

    #[must_use]
    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// Processes `turn` to its end, emitting every event on `sink`.
    ///
    /// Exactly one of `stream.complete` and `stream.error` is emitted.
    pub async fn run(
        &self,
        turn: Turn,
        gate: &ApprovalGate,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> SessionOutcome {
        let mut session =
            StreamingSession::new(turn.message_id.clone(), turn.session_id.clone(), &turn.model);

        let result = self.drive(&mut session, &turn.text, gate, sink, cancel).await;
        let message_id = session.message_id.clone();

        match result {
            Ok(()) => {
                info!(
                    message = %message_id,
                    tools = session.tool_calls().len(),
                    degraded = session.is_degraded(),
                    "Session complete"
                );
                SessionOutcome::Completed {
                    degraded: session.is_degraded(),
                }
            }
            Err(PilotError::Cancelled) => {
                let withdrawn = gate.cancel_message(&message_id);
                let dequeued = self.queue.cancel_message(&message_id);
                info!(message = %message_id, withdrawn, dequeued, "Session cancelled");
                session.fail();
                sink.emit(ServerEvent::StreamError {
                    message_id,
                    error: PilotError::Cancelled.user_message(),
                });
                SessionOutcome::Cancelled
            }
            Err(e) => {
                warn!(message = %message_id, phase = %session.phase(), "Session failed: {e}");
                gate.cancel_message(&message_id);
                session.fail();
                let error = e.user_message();
                sink.emit(ServerEvent::StreamError {
                    message_id,
                    error: error.clone(),
                });
                SessionOutcome::Failed { error }
            }
        }
    }

    async fn drive(
        &self,
        session: &mut StreamingSession,
        text: &str,
        gate: &ApprovalGate,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> PilotResult<()> {
        let message_id = session.message_id.clone();
        sink.emit(ServerEvent::StreamStart {
            message_id: message_id.clone(),
        });

        let context = self.load_context(session).await;
        let stored = self
            .store
            .create_message(&session.session_id, Role::User, text)
            .await;
        persisted(session, "user message", stored);
        let record = self
            .store
            .create_message(&session.session_id, Role::Assistant, "")
            .await;
        let record_id = persisted(session, "assistant message", record);
        session.record_id = record_id;

        sink.emit(ServerEvent::StreamThinking {
            message_id: message_id.clone(),
        });
        let planned = self.plan(session, &context, text, cancel).await?;

        if !planned.is_empty() {
            session.advance(SessionPhase::ToolExecution)?;
        }
        for planned in planned {
            if cancel.is_cancelled() {
                return Err(PilotError::Cancelled);
            }
            let ResolvedCall { call, error } =
                self.run_tool(session, planned, gate, sink, cancel).await?;
            let fatal = call.required && call.status() == ToolCallStatus::Error;
            let name = call.name.clone();
            session.record_tool(call);
            if fatal {
                return Err(error.unwrap_or_else(|| {
                    PilotError::tool_failed(name, "the call did not complete")
                }));
            }
        }

        session.advance(SessionPhase::Responding)?;
        let request = GenerationRequest {
            model: session.model.clone(),
            context,
            user_text: text.to_string(),
            tool_results: session.summaries(),
        };
        self.respond(session, &request, sink, cancel).await?;

        if let Some(record) = session.record_id.clone() {
            let updated = self
                .store
                .update_message_content(&record, session.text())
                .await;
            persisted(session, "assistant message content", updated);
        }
        session.advance(SessionPhase::Complete)?;
        sink.emit(ServerEvent::StreamComplete {
            message_id,
            message: session.final_message(),
        });
        Ok(())
    }

    async fn load_context(&self, session: &mut StreamingSession) -> Vec<ContextMessage> {
        let recent = self
            .store
            .list_recent_messages(&session.session_id, self.context_messages)
            .await;
        persisted(session, "context", recent)
            .unwrap_or_default()
            .iter()
            .filter(|m| !m.content.is_empty())
            .map(ContextMessage::from)
            .collect()
    }

    async fn plan(
        &self,
        session: &StreamingSession,
        context: &[ContextMessage],
        text: &str,
        cancel: &CancellationToken,
    ) -> PilotResult<Vec<PlannedTool>> {
        let request = SelectionRequest {
            model: session.model.clone(),
            context: context.to_vec(),
            user_text: text.to_string(),
            tools: self.catalog.iter().cloned().collect(),
            max_tools: self.max_tools,
        };

        let selected = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PilotError::Cancelled),
            selected = self.selector.select(&request) => selected,
        };

        match selected {
            Ok(mut planned) => {
                planned.truncate(self.max_tools);
                debug!(message = %session.message_id, count = planned.len(), "Tools planned");
                Ok(planned)
            }
            Err(e) => {
                warn!(message = %session.message_id, "Tool selection failed, answering without tools: {e}");
                Ok(Vec::new())
            }
        }
    }

    /// Runs one planned call to a terminal status.
    ///
    /// Returns [`PilotError::Cancelled`] if the session was cancelled while
    /// the call waited or ran.
    async fn run_tool(
        &self,
        session: &mut StreamingSession,
        planned: PlannedTool,
        gate: &ApprovalGate,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> PilotResult<ResolvedCall> {
        let message_id = session.message_id.clone();
        let mut call = ToolCall::new(
            planned.name,
            planned.arguments,
            message_id.clone(),
            session.session_id.clone(),
        )
        .required(planned.required);

        let execution = match session.record_id.clone() {
            Some(record) => {
                let created = self
                    .store
                    .create_tool_execution(&record, &call.name, &call.arguments)
                    .await;
                persisted(session, "tool execution", created)
            }
            None => None,
        };

        let Some(description) = self.catalog.get(&call.name).map(|t| t.description.clone()) else {
            let error = PilotError::tool_failed(call.name.clone(), "tool is not available on the server");
            call.fail(error.user_message())?;
            self.emit_resolution(sink, &call);
            self.record_execution(session, execution.as_ref(), &call).await;
            return Ok(ResolvedCall {
                call,
                error: Some(error),
            });
        };

        if gate.needs_approval(&call.name) {
            call = call.pending_approval();
            let decision = tokio::select! {
                biased;
                _ = cancel.cancelled() => ApprovalDecision::Withdrawn,
                decision = gate.check(&call, &description, sink) => decision,
            };
            match decision {
                ApprovalDecision::Denied { reason } => {
                    info!(tool = %call.name, "Tool call denied");
                    let error = PilotError::approval_denied(call.name.clone(), reason.clone());
                    call.deny(reason)?;
                    self.emit_resolution(sink, &call);
                    self.record_execution(session, execution.as_ref(), &call).await;
                    return Ok(ResolvedCall {
                        call,
                        error: Some(error),
                    });
                }
                ApprovalDecision::Withdrawn => {
                    call.fail(PilotError::Cancelled.user_message())?;
                    self.record_execution(session, execution.as_ref(), &call).await;
                    return Err(PilotError::Cancelled);
                }
                ApprovalDecision::Allowed
                | ApprovalDecision::ApprovedOnce
                | ApprovalDecision::ApprovedAlways => call.approve()?,
            }
        }

        let tool_name = call.name.clone();
        let arguments = call.arguments.clone();
        let (notice_tx, mut notices) = mpsc::unbounded_channel();
        let ctx = RequestContext::new(session.session_id.clone(), cancel.clone())
            .with_notices(notice_tx);
        let ticket = self.queue.submit(call, ctx);
        let wait = ticket.wait();
        tokio::pin!(wait);

        let mut started = false;
        let mut notices_open = true;
        let mut withdrawn = false;
        let resolved = loop {
            tokio::select! {
                biased;
                notice = notices.recv(), if notices_open => match notice {
                    Some(CallNotice::Started { attempt }) if !started => {
                        started = true;
                        debug!(tool = %tool_name, attempt, "Tool call started");
                        sink.emit(ServerEvent::ToolStart {
                            message_id: message_id.clone(),
                            tool_name: tool_name.clone(),
                            arguments: arguments.clone(),
                        });
                        if let Some(id) = &execution {
                            let update = ToolExecutionUpdate {
                                status: ToolCallStatus::Executing,
                                result: None,
                                error: None,
                                execution_time_ms: None,
                            };
                            let written = self.store.update_tool_execution(id, update).await;
                            persisted(session, "tool execution status", written);
                        }
                    }
                    Some(CallNotice::Progress(progress)) if started => {
                        sink.emit(ServerEvent::ToolProgress {
                            message_id: message_id.clone(),
                            tool_name: tool_name.clone(),
                            progress,
                        });
                    }
                    Some(CallNotice::Retrying { attempt, delay, error }) => {
                        debug!(
                            tool = %tool_name,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Tool call will be retried: {error}"
                        );
                    }
                    Some(_) => {}
                    None => notices_open = false,
                },
                _ = cancel.cancelled(), if !withdrawn => {
                    withdrawn = true;
                    self.queue.cancel_message(&message_id);
                }
                resolved = &mut wait => break resolved,
            }
        };

        self.record_execution(session, execution.as_ref(), &resolved.call)
            .await;
        if resolved.is_cancelled() {
            return Err(PilotError::Cancelled);
        }
        self.emit_resolution(sink, &resolved.call);
        Ok(resolved)
    }

    /// Streams the answer into the session.
    async fn respond(
        &self,
        session: &mut StreamingSession,
        request: &GenerationRequest,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> PilotResult<()> {
        let (tx, mut rx) = mpsc::channel(64);
        let generation = self.generator.stream_reply(request, tx);
        tokio::pin!(generation);

        let mut finished = None;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PilotError::Cancelled),
                chunk = rx.recv() => match chunk {
                    Some(chunk) => {
                        session.push_text(&chunk);
                        sink.emit(ServerEvent::TextChunk {
                            message_id: session.message_id.clone(),
                            chunk,
                        });
                    }
                    None => break,
                },
                result = &mut generation, if finished.is_none() => finished = Some(result),
            }
        }

        let result = match finished {
            Some(result) => result,
            None => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PilotError::Cancelled),
                result = &mut generation => result,
            },
        };
        result.map_err(|e| match e {
            PilotError::Generation { .. } => e,
            other => PilotError::generation(other.to_string()),
        })
    }

    fn emit_resolution(&self, sink: &EventSink, call: &ToolCall) {
        let message_id = call.message_id.clone();
        let tool_name = call.name.clone();
        let event = match call.status() {
            ToolCallStatus::Completed => ServerEvent::ToolComplete {
                message_id,
                tool_name,
                result: call.result.clone().unwrap_or_default(),
                execution_time_ms: call.execution_time_ms.unwrap_or_default(),
            },
            ToolCallStatus::Denied => ServerEvent::ToolDenied {
                message_id,
                tool_name,
                reason: call.error.clone(),
            },
            _ => ServerEvent::ToolError {
                message_id,
                tool_name,
                error: call
                    .error
                    .clone()
                    .unwrap_or_else(|| "The tool call failed.".to_string()),
            },
        };
        sink.emit(event);
    }

    async fn record_execution(
        &self,
        session: &mut StreamingSession,
        execution: Option<&ExecutionId>,
        call: &ToolCall,
    ) {
        let Some(id) = execution else {
            return;
        };
        let update = ToolExecutionUpdate {
            status: call.status(),
            result: call.result.clone(),
            error: call.error.clone(),
            execution_time_ms: call.execution_time_ms,
        };
        let written = self.store.update_tool_execution(id, update).await;
        persisted(session, "tool execution", written);
    }
}

/// Unwraps a store result. Failures are logged and degrade the session.
fn persisted<T>(session: &mut StreamingSession, what: &str, result: PilotResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(message = %session.message_id, "Failed to persist {what}: {e}");
            session.mark_degraded();
            None
        }
    }
}
