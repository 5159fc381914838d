//! Top-level wiring of the tool-execution orchestrator.
//!
//! The [`Orchestrator`] owns the connection pool, the retry queue and the
//! session coordinator, and keeps one approval gate per conversation.
//! Client connections hand it [`ClientHandle`]s; every user message runs
//! in its own task under a cancellation token derived from the client's.
//!
//! ```text
//! client ─▶ submit_message ─▶ spawn(SessionCoordinator::run)
//!                                  ├─ ApprovalGate (per conversation)
//!                                  ├─ RetryQueue ─▶ ToolExecutor ─▶ ConnectionPool
//!                                  └─ TextGenerator
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{TextGenerator, ToolSelector};
use crate::approval::{ApprovalDecision, ApprovalGate, ApprovalPolicy};
use crate::error::{PilotError, PilotResult};
use crate::pool::{ConnectionPool, PoolStats};
use crate::ratelimit::SlidingWindowLimiter;
use crate::session::{SessionCoordinator, Turn};
use crate::store::ChatStore;
use crate::tools::{RetryPolicy, RetryQueue, ToolCatalog, ToolExecutor, ToolNamespace};
use crate::types::{ApprovalId, Config, EventSink, MessageId, ServerEvent, SessionId};

/// One connected client.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    /// Rate-limit key, the peer address.
    pub id: String,
    pub sink: EventSink,
    /// Cancelled when the client goes away.
    pub cancel: CancellationToken,
}

impl ClientHandle {
    #[must_use]
    pub fn new(id: impl Into<String>, sink: EventSink) -> Self {
        Self {
            id: id.into(),
            sink,
            cancel: CancellationToken::new(),
        }
    }
}

/// State shared by every message of one conversation.
struct Conversation {
    gate: ApprovalGate,
    running: AtomicUsize,
    last_active: Mutex<Instant>,
}

impl Conversation {
    fn new(policy: ApprovalPolicy) -> Self {
        Self {
            gate: ApprovalGate::new(policy),
            running: AtomicUsize::new(0),
            last_active: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_active.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    /// True once nothing runs or waits in the conversation for `ttl`.
    fn is_expired(&self, ttl: Duration) -> bool {
        self.running.load(Ordering::SeqCst) == 0
            && self.gate.outstanding().is_none()
            && self.gate.waiting() == 0
            && self
                .last_active
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .elapsed()
                >= ttl
    }
}

struct ActiveMessage {
    session_id: SessionId,
    cancel: CancellationToken,
}

/// Counters reported by the health endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStats {
    pub pool: PoolStats,
    pub queued_tool_calls: usize,
    pub active_messages: usize,
    pub conversations: usize,
    pub tools: usize,
}

/// The collaborators an orchestrator is built from.
pub struct Collaborators {
    pub selector: Arc<dyn ToolSelector>,
    pub generator: Arc<dyn TextGenerator>,
    pub store: Arc<dyn ChatStore>,
}

/// Routes client messages to streaming sessions.
pub struct Orchestrator {
    pool: ConnectionPool,
    queue: Arc<RetryQueue>,
    coordinator: SessionCoordinator,
    policy: ApprovalPolicy,
    message_limiter: SlidingWindowLimiter,
    tool_limiter: Option<Arc<SlidingWindowLimiter>>,
    conversation_ttl: Duration,
    default_model: String,
    conversations: DashMap<SessionId, Arc<Conversation>>,
    active: DashMap<MessageId, ActiveMessage>,
    idle: Notify,
    closing: AtomicBool,
}

impl Orchestrator {
    /// Builds the orchestrator over an initialized pool and starts the
    /// queue worker.
    #[must_use]
    pub fn new(
        config: &Config,
        pool: ConnectionPool,
        catalog: ToolCatalog,
        collaborators: Collaborators,
    ) -> Arc<Self> {
        let namespace = ToolNamespace::new(config.mcp.tool_prefix.clone());
        let executor = ToolExecutor::new(pool.clone(), namespace, config.session.cancel_grace);
        let tool_limiter = (config.rate_limit.max_tool_calls > 0).then(|| {
            Arc::new(SlidingWindowLimiter::new(
                config.rate_limit.window,
                config.rate_limit.max_tool_calls,
            ))
        });
        let queue = Arc::new(RetryQueue::start(
            executor,
            RetryPolicy::from(&config.retry),
            tool_limiter.clone(),
        ));

        let coordinator = SessionCoordinator::new(
            Arc::clone(&queue),
            collaborators.selector,
            collaborators.generator,
            collaborators.store,
            Arc::new(catalog),
        )
        .with_context_messages(config.session.context_messages)
        .with_max_tools(config.model.max_tools_per_message);

        Arc::new(Self {
            pool,
            queue,
            coordinator,
            policy: ApprovalPolicy::from(&config.approval),
            message_limiter: SlidingWindowLimiter::new(
                config.rate_limit.window,
                config.rate_limit.max_messages,
            ),
            tool_limiter,
            conversation_ttl: config.session.conversation_idle_ttl,
            default_model: config.model.name.clone(),
            conversations: DashMap::new(),
            active: DashMap::new(),
            idle: Notify::new(),
            closing: AtomicBool::new(false),
        })
    }

    /// Returns the conversation with one more running message. The count
    /// is taken under the map entry so eviction cannot race it.
    fn enter_conversation(&self, session_id: &SessionId) -> Arc<Conversation> {
        let entry = self
            .conversations
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(Conversation::new(self.policy.clone())));
        entry.value().running.fetch_add(1, Ordering::SeqCst);
        entry.value().touch();
        Arc::clone(entry.value())
    }

    /// Forgets conversations idle for longer than the configured TTL and
    /// rate-limit keys whose window has passed.
    fn evict_idle(&self) {
        let ttl = self.conversation_ttl;
        let mut evicted = Vec::new();
        self.conversations.retain(|session_id, conversation| {
            let expired = conversation.is_expired(ttl);
            if expired {
                evicted.push(session_id.clone());
            }
            !expired
        });
        for session_id in &evicted {
            debug!(session = %session_id, "Conversation evicted");
        }
        if let Some(limiter) = &self.tool_limiter {
            limiter.sweep();
        }
        self.message_limiter.sweep();
    }

    /// Starts processing a user message.
    ///
    /// A submit without `session_id` opens a new conversation and announces
    /// it with `session.ready`. Returns the id every event of the message
    /// will carry.
    ///
    /// # Errors
    ///
    /// Returns [`PilotError::RateLimited`] (after emitting `rate_limited`)
    /// when the client exceeded its message budget, and
    /// [`PilotError::InvalidState`] during shutdown.
    pub fn submit_message(
        self: &Arc<Self>,
        client: &ClientHandle,
        text: String,
        model: Option<String>,
        session_id: Option<SessionId>,
    ) -> PilotResult<MessageId> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(PilotError::invalid_state("orchestrator is shutting down"));
        }
        if let Err(e) = self.message_limiter.check(&client.id) {
            if let PilotError::RateLimited { retry_after_ms } = e {
                client.sink.emit(ServerEvent::RateLimited { retry_after_ms });
            }
            warn!(client = %client.id, "Message rejected by rate limiter");
            return Err(e);
        }

        let session_id = match session_id {
            Some(id) => id,
            None => {
                let id = SessionId::new();
                client.sink.emit(ServerEvent::SessionReady {
                    session_id: id.clone(),
                });
                id
            }
        };
        self.evict_idle();
        let conversation = self.enter_conversation(&session_id);

        let message_id = MessageId::new();
        let cancel = client.cancel.child_token();
        self.active.insert(
            message_id.clone(),
            ActiveMessage {
                session_id: session_id.clone(),
                cancel: cancel.clone(),
            },
        );

        let turn = Turn {
            session_id,
            message_id: message_id.clone(),
            text,
            model: model.unwrap_or_else(|| self.default_model.clone()),
        };
        info!(message = %turn.message_id, session = %turn.session_id, "Message submitted");

        let this = Arc::clone(self);
        let sink = client.sink.clone();
        tokio::spawn(async move {
            let message_id = turn.message_id.clone();
            let outcome = this
                .coordinator
                .run(turn, &conversation.gate, &sink, &cancel)
                .await;
            debug!(message = %message_id, outcome = outcome.label(), "Session finished");
            conversation.touch();
            conversation.running.fetch_sub(1, Ordering::SeqCst);
            this.finish(&message_id);
        });

        Ok(message_id)
    }

    fn finish(&self, message_id: &MessageId) {
        self.evict_idle();
        self.active.remove(message_id);
        if self.active.is_empty() {
            self.idle.notify_waiters();
        }
    }

    /// Answers an outstanding approval prompt.
    ///
    /// # Errors
    ///
    /// Returns [`PilotError::NotFound`] if no conversation is waiting on
    /// `id`.
    pub fn respond_approval(
        &self,
        id: &ApprovalId,
        approved: bool,
        always: bool,
        reason: Option<String>,
    ) -> PilotResult<ApprovalDecision> {
        let conversation = self
            .conversations
            .iter()
            .find(|entry| entry.value().gate.outstanding().as_ref() == Some(id))
            .map(|entry| Arc::clone(entry.value()));

        match conversation {
            Some(conversation) => conversation.gate.respond(id, approved, always, reason),
            None => Err(PilotError::not_found("approval", id.as_str())),
        }
    }

    /// Cancels one in-flight message. Returns false if it is not running.
    pub fn cancel_message(&self, message_id: &MessageId) -> bool {
        match self.active.get(message_id) {
            Some(active) => {
                debug!(message = %message_id, session = %active.session_id, "Cancelling message");
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels everything a client started.
    pub fn disconnect(&self, client: &ClientHandle) {
        client.cancel.cancel();
        debug!(client = %client.id, "Client disconnected");
    }

    #[must_use]
    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            pool: self.pool.stats(),
            queued_tool_calls: self.queue.len(),
            active_messages: self.active.len(),
            conversations: self.conversations.len(),
            tools: self.coordinator.catalog().len(),
        }
    }

    #[must_use]
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Number of messages currently being processed.
    #[must_use]
    pub fn active_messages(&self) -> usize {
        self.active.len()
    }

    /// Cancels every in-flight message, waits up to `grace` for them to
    /// end, then stops the queue and closes the pool.
    pub async fn shutdown(&self, grace: Duration) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(active = self.active.len(), "Orchestrator shutting down");

        for entry in &self.active {
            entry.value().cancel.cancel();
        }
        for entry in &self.conversations {
            entry.value().gate.cancel_all();
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let idle = self.idle.notified();
            if self.active.is_empty() {
                break;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                warn!(active = self.active.len(), "Sessions still running after shutdown grace");
                break;
            }
        }

        self.queue.shutdown().await;
        let abandoned = self.pool.shutdown(grace).await;
        info!(abandoned, "Orchestrator stopped");
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("active", &self.active.len())
            .field("conversations", &self.conversations.len())
            .finish_non_exhaustive()
    }
}
