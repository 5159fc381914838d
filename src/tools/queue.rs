//! Single-worker retry queue for tool calls.
//!
//! Every call that reaches the tool-execution server passes through one
//! worker, so tool concurrency is one regardless of how many sessions are
//! active. Submission returns a [`QueueTicket`] that resolves exactly once.
//!
//! # Ordering
//!
//! Requests run in submission order, with one exception: a call that fails
//! with a retryable error is put back at the **front** of the queue, ahead
//! of newer arrivals, and the worker waits out its delay before running
//! anything else. The n-th retry of a call waits `base_delay * n`.
//!
//! ```text
//! submit ──▶ [ c3 | c2 | c1 ] ──▶ worker ──▶ executor
//!                        ▲            │
//!                        └────────────┘ retryable failure (front, delayed)
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::PilotError;
use crate::ratelimit::SlidingWindowLimiter;
use crate::tools::executor::ToolExecutor;
use crate::tools::{CallNotice, RequestContext, ToolCall, ToolCallStatus};
use crate::types::config::RetrySettings;
use crate::types::{MessageId, SessionId, ToolCallId};

/// When and how often failed calls are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// The n-th retry waits `base_delay * n`.
    pub base_delay: Duration,
    /// Retry failures reported by the tool itself.
    pub retry_tool_errors: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: settings.base_delay,
            retry_tool_errors: settings.retry_tool_errors,
        }
    }
}

impl RetryPolicy {
    /// Returns true if `error` may be retried under this policy.
    #[must_use]
    pub fn is_retryable(&self, error: &PilotError) -> bool {
        error.is_retryable() || (self.retry_tool_errors && error.is_tool_level())
    }

    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(retry)
    }
}

/// The terminal outcome of a submitted call.
#[derive(Debug)]
pub struct ResolvedCall {
    /// The call, in a terminal status.
    pub call: ToolCall,
    /// Why it did not complete, if it did not.
    pub error: Option<PilotError>,
}

impl ResolvedCall {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.call.status() == ToolCallStatus::Completed
    }

    #[must_use]
    pub fn is_denied(&self) -> bool {
        self.call.status() == ToolCallStatus::Denied
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, Some(PilotError::Cancelled))
    }
}

/// Handle to a submitted call.
#[derive(Debug)]
pub struct QueueTicket {
    snapshot: ToolCall,
    rx: oneshot::Receiver<ResolvedCall>,
}

impl QueueTicket {
    #[must_use]
    pub fn id(&self) -> &ToolCallId {
        &self.snapshot.id
    }

    /// Waits for the call to resolve.
    ///
    /// If the worker disappeared without answering, the call resolves as
    /// an error rather than hanging.
    pub async fn wait(self) -> ResolvedCall {
        match self.rx.await {
            Ok(resolved) => resolved,
            Err(_) => {
                let mut call = self.snapshot;
                let error = PilotError::QueueCleared;
                let _ = call.fail(error.user_message());
                ResolvedCall {
                    call,
                    error: Some(error),
                }
            }
        }
    }
}

struct QueuedRequest {
    call: ToolCall,
    ctx: RequestContext,
    responder: oneshot::Sender<ResolvedCall>,
    not_before: Option<Instant>,
}

impl QueuedRequest {
    fn resolve(self, error: Option<PilotError>) {
        let _ = self.responder.send(ResolvedCall {
            call: self.call,
            error,
        });
    }

    /// Resolves as failed without executing (again).
    fn reject(mut self, error: PilotError) {
        if let Err(e) = self.call.fail(error.user_message()) {
            debug!("Rejecting call in unexpected state: {e}");
        }
        self.resolve(Some(error));
    }
}

struct QueueShared {
    pending: Mutex<VecDeque<QueuedRequest>>,
    wake: Notify,
    stop: CancellationToken,
    executor: ToolExecutor,
    policy: RetryPolicy,
    limiter: Option<Arc<SlidingWindowLimiter>>,
}

impl QueueShared {
    fn pending(&self) -> MutexGuard<'_, VecDeque<QueuedRequest>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }
}

enum Next {
    Idle,
    Until(Instant),
    Run(QueuedRequest),
}

/// FIFO retry queue with one worker.
pub struct RetryQueue {
    shared: Arc<QueueShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RetryQueue {
    /// Creates the queue and spawns its worker.
    ///
    /// `limiter`, when given, admits each call once per conversation before
    /// its first attempt.
    #[must_use]
    pub fn start(
        executor: ToolExecutor,
        policy: RetryPolicy,
        limiter: Option<Arc<SlidingWindowLimiter>>,
    ) -> Self {
        let shared = Arc::new(QueueShared {
            pending: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            stop: CancellationToken::new(),
            executor,
            policy,
            limiter,
        });
        let worker = tokio::spawn(run_worker(Arc::clone(&shared)));
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        self.shared.policy
    }

    /// Enqueues a call at the back of the queue.
    ///
    /// After shutdown the ticket resolves immediately with
    /// [`PilotError::QueueCleared`].
    pub fn submit(&self, call: ToolCall, ctx: RequestContext) -> QueueTicket {
        let (tx, rx) = oneshot::channel();
        let snapshot = call.clone();
        let request = QueuedRequest {
            call,
            ctx,
            responder: tx,
            not_before: None,
        };

        // Checked under the lock so the worker's final drain cannot miss it
        let mut pending = self.shared.pending();
        if self.shared.stop.is_cancelled() {
            drop(pending);
            request.reject(PilotError::QueueCleared);
        } else {
            debug!(tool = %snapshot.name, "Tool call queued");
            pending.push_back(request);
            drop(pending);
            self.shared.wake.notify_one();
        }

        QueueTicket { snapshot, rx }
    }

    /// Number of calls waiting (including delayed retries).
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.pending().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rejects every waiting call with "queue cleared".
    ///
    /// Returns how many were rejected. A call already running is not
    /// affected.
    pub fn clear(&self) -> usize {
        let drained: Vec<_> = self.shared.pending().drain(..).collect();
        let count = drained.len();
        for request in drained {
            request.reject(PilotError::QueueCleared);
        }
        if count > 0 {
            info!(count, "Retry queue cleared");
        }
        count
    }

    /// Rejects the waiting calls of one conversation as cancelled.
    pub fn cancel_session(&self, session_id: &SessionId) -> usize {
        let count = self.cancel_where(|request| &request.ctx.session_id == session_id);
        if count > 0 {
            debug!(session = %session_id, count, "Cancelled queued tool calls");
        }
        count
    }

    /// Rejects the waiting calls of one message as cancelled.
    pub fn cancel_message(&self, message_id: &MessageId) -> usize {
        let count = self.cancel_where(|request| &request.call.message_id == message_id);
        if count > 0 {
            debug!(message = %message_id, count, "Cancelled queued tool calls");
        }
        count
    }

    fn cancel_where(&self, matches: impl Fn(&QueuedRequest) -> bool) -> usize {
        let removed: VecDeque<_> = {
            let mut pending = self.shared.pending();
            let (removed, kept) = pending.drain(..).partition(|request| matches(request));
            *pending = kept;
            removed
        };
        let count = removed.len();
        for request in removed {
            request.reject(PilotError::Cancelled);
        }
        if count > 0 {
            self.shared.wake.notify_one();
        }
        count
    }

    /// Clears the queue and stops the worker once its current call ends.
    pub async fn shutdown(&self) {
        self.shared.stop.cancel();
        self.clear();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Retry queue worker ended abnormally: {e}");
            }
        }
    }
}

async fn run_worker(shared: Arc<QueueShared>) {
    debug!("Retry queue worker started");
    loop {
        let next = {
            let mut pending = shared.pending();
            match pending.front().and_then(|request| request.not_before) {
                Some(at) if at > Instant::now() => Next::Until(at),
                _ => pending.pop_front().map_or(Next::Idle, Next::Run),
            }
        };

        match next {
            Next::Run(request) => process(&shared, request).await,
            Next::Idle => {
                tokio::select! {
                    _ = shared.wake.notified() => {}
                    _ = shared.stop.cancelled() => break,
                }
            }
            Next::Until(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => {}
                    _ = shared.wake.notified() => {}
                    _ = shared.stop.cancelled() => break,
                }
            }
        }

        if shared.stop.is_cancelled() {
            break;
        }
    }

    // Anything submitted while the last call ran
    let leftover: Vec<_> = shared.pending().drain(..).collect();
    for request in leftover {
        request.reject(PilotError::QueueCleared);
    }
    debug!("Retry queue worker stopped");
}

async fn process(shared: &QueueShared, mut request: QueuedRequest) {
    if request.ctx.is_cancelled() {
        request.reject(PilotError::Cancelled);
        return;
    }

    if request.call.status() == ToolCallStatus::Denied {
        let error =
            PilotError::approval_denied(request.call.name.clone(), request.call.error.clone());
        request.resolve(Some(error));
        return;
    }

    if request.call.retry_count == 0 {
        if let Some(limiter) = &shared.limiter {
            if let Err(e) = limiter.check(request.ctx.session_id.as_str()) {
                warn!(tool = %request.call.name, "Tool call rate limited");
                request.reject(e);
                return;
            }
        }
    }

    if let Err(e) = request.call.start() {
        request.reject(e);
        return;
    }

    let attempt = request.call.retry_count + 1;
    let result = shared
        .executor
        .execute(&request.call, &request.ctx, attempt)
        .await;

    match result {
        Ok(execution) => {
            if let Err(e) = request
                .call
                .complete(execution.output.result, execution.elapsed)
            {
                warn!("Completed call in unexpected state: {e}");
            }
            request.resolve(None);
        }
        Err(error) if shared.policy.is_retryable(&error) => {
            if request.call.retry_count >= shared.policy.max_retries {
                warn!(
                    tool = %request.call.name,
                    attempts = attempt,
                    "Retries exhausted: {error}"
                );
                let exhausted = PilotError::retries_exhausted(
                    request.call.name.clone(),
                    attempt,
                    error.to_string(),
                );
                request.reject(exhausted);
                return;
            }

            request.call.retry_count += 1;
            let delay = shared.policy.delay_for(request.call.retry_count);
            info!(
                tool = %request.call.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying tool call: {error}"
            );
            request.ctx.notify(CallNotice::Retrying {
                attempt,
                delay,
                error: error.user_message(),
            });
            request.not_before = Some(Instant::now() + delay);
            shared.pending().push_front(request);
        }
        Err(error) => request.reject(error),
    }
}
