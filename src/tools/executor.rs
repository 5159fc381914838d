//! Runs one attempt of a tool call on a pooled connection.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{PilotError, PilotResult};
use crate::pool::ConnectionPool;
use crate::tools::{CallNotice, RequestContext, ToolCall, ToolNamespace, ToolOutput};

/// A successful attempt.
#[derive(Debug, Clone)]
pub struct ToolExecution {
    pub output: ToolOutput,
    pub elapsed: Duration,
    /// Connection the call ran on.
    pub connection: u64,
}

enum Attempt {
    Finished(PilotResult<ToolOutput>),
    /// Cancelled, and the call settled within the grace period.
    Settled(PilotResult<ToolOutput>),
    /// Cancelled, and the grace period ran out.
    Abandoned,
}

/// Executes tool calls against the pool.
///
/// The connection is held only for the duration of one attempt and is
/// released on every path, including cancellation.
#[derive(Clone)]
pub struct ToolExecutor {
    pool: ConnectionPool,
    namespace: ToolNamespace,
    cancel_grace: Duration,
}

impl ToolExecutor {
    #[must_use]
    pub fn new(pool: ConnectionPool, namespace: ToolNamespace, cancel_grace: Duration) -> Self {
        Self {
            pool,
            namespace,
            cancel_grace,
        }
    }

    #[must_use]
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    #[must_use]
    pub fn namespace(&self) -> &ToolNamespace {
        &self.namespace
    }

    /// Runs one attempt of `call`.
    ///
    /// Sends [`CallNotice::Started`] once a connection is held and forwards
    /// server progress as [`CallNotice::Progress`].
    ///
    /// # Errors
    ///
    /// Pool and transport failures are returned unchanged so the caller
    /// can retry them; a transport failure also marks the connection
    /// unhealthy. Tool-level errors carry the call's display name.
    /// Returns [`PilotError::Cancelled`] if `ctx` is cancelled before or
    /// during the attempt.
    pub async fn execute(
        &self,
        call: &ToolCall,
        ctx: &RequestContext,
        attempt: u32,
    ) -> PilotResult<ToolExecution> {
        if ctx.is_cancelled() {
            return Err(PilotError::Cancelled);
        }

        let mut guard = tokio::select! {
            acquired = self.pool.acquire() => acquired?,
            _ = ctx.cancel.cancelled() => return Err(PilotError::Cancelled),
        };
        let connection = guard.id();
        ctx.notify(CallNotice::Started { attempt });

        let wire = self.namespace.to_wire(&call.name);
        debug!(tool = %call.name, wire = %wire, connection, attempt, "Executing tool");

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let forward = ctx.clone();
        tokio::spawn(async move {
            while let Some(percent) = progress_rx.recv().await {
                forward.notify(CallNotice::Progress(percent));
            }
        });

        let started = Instant::now();
        let outcome = {
            let mut pending = guard
                .connection()
                .call_tool(wire, &call.arguments, Some(progress_tx));
            tokio::select! {
                biased;
                result = &mut pending => Attempt::Finished(result),
                _ = ctx.cancel.cancelled() => {
                    match tokio::time::timeout(self.cancel_grace, &mut pending).await {
                        Ok(result) => Attempt::Settled(result),
                        Err(_) => Attempt::Abandoned,
                    }
                }
            }
        };
        let elapsed = started.elapsed();

        match outcome {
            Attempt::Finished(Ok(output)) => {
                info!(
                    tool = %call.name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Tool call completed"
                );
                Ok(ToolExecution {
                    output,
                    elapsed,
                    connection,
                })
            }
            Attempt::Finished(Err(e)) => {
                if e.poisons_connection() {
                    guard.mark_unhealthy();
                }
                warn!(tool = %call.name, attempt, "Tool call failed: {e}");
                Err(e.for_tool(&call.name))
            }
            Attempt::Settled(result) => {
                if result.as_ref().is_err_and(PilotError::poisons_connection) {
                    guard.mark_unhealthy();
                }
                debug!(tool = %call.name, "Discarding result of cancelled call");
                Err(PilotError::Cancelled)
            }
            Attempt::Abandoned => {
                warn!(
                    tool = %call.name,
                    grace_ms = self.cancel_grace.as_millis() as u64,
                    "Cancelled call did not settle, dropping its connection"
                );
                guard.mark_unhealthy();
                Err(PilotError::Cancelled)
            }
        }
    }
}
