//! Bounded pool of persistent connections to the tool-execution server.
//!
//! The pool owns a fixed number of slots. A caller holds a slot for the
//! duration of one tool call through a [`PoolGuard`]; dropping the guard
//! (or calling [`PoolGuard::release`]) returns the connection to the idle
//! list, or discards it if the call marked it unhealthy.
//!
//! ```text
//!            acquire()                      drop / release()
//!   idle ──────────────────▶ in-use ─────────────────────────▶ idle
//!    │                         │
//!    │ transport dead          │ mark_unhealthy()
//!    ▼                         ▼
//!  closed ◀──────────────── unhealthy  (replaced on next acquire)
//! ```
//!
//! Slots are counted by a semaphore, so at most `size` connections exist
//! and at most `size` are ever in use, no matter how many sessions are
//! active. Dead connections are replaced lazily: the next acquisition that
//! finds no usable idle connection opens a fresh one while holding its
//! slot.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PilotError, PilotResult};
use crate::mcp::protocol::McpTool;
use crate::tools::ToolOutput;
use crate::types::config::PoolSettings;

/// Receives best-effort progress percentages for one call.
pub type ProgressSink = mpsc::UnboundedSender<u8>;

/// One live link to the tool-execution server.
#[async_trait]
pub trait ToolConnection: Send {
    /// Invokes a tool by its wire name.
    async fn call_tool(
        &mut self,
        name: &str,
        arguments: &Value,
        progress: Option<ProgressSink>,
    ) -> PilotResult<ToolOutput>;

    /// Lists the tools the server offers.
    async fn list_tools(&mut self) -> PilotResult<Vec<McpTool>>;

    /// Liveness probe.
    async fn ping(&mut self) -> PilotResult<()>;

    /// Returns false once the underlying transport is known to be dead.
    fn is_alive(&self) -> bool;

    /// Closes the connection.
    async fn close(&mut self);
}

/// Opens new connections for the pool.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> PilotResult<Box<dyn ToolConnection>>;
}

/// Lifecycle state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    InUse,
    Unhealthy,
    Closed,
}

/// A connection owned by the pool.
pub struct PooledConnection {
    id: u64,
    conn: Box<dyn ToolConnection>,
    state: ConnectionState,
    last_used: Instant,
}

impl PooledConnection {
    fn new(id: u64, conn: Box<dyn ToolConnection>) -> Self {
        Self {
            id,
            conn,
            state: ConnectionState::Idle,
            last_used: Instant::now(),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    fn is_usable(&self) -> bool {
        self.state != ConnectionState::Unhealthy && self.conn.is_alive()
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Connections currently open (idle + in use).
    pub total: usize,
    /// Slots that can be acquired without waiting.
    pub available: usize,
    /// Connections currently borrowed.
    pub in_use: usize,
    /// Callers blocked in `acquire`.
    pub waiting: usize,
}

struct PoolShared {
    connector: Arc<dyn Connector>,
    slots: Arc<Semaphore>,
    idle: Mutex<VecDeque<PooledConnection>>,
    size: usize,
    acquire_timeout: Duration,
    next_id: AtomicU64,
    total: AtomicUsize,
    in_use: AtomicUsize,
    waiting: AtomicUsize,
    closed: AtomicBool,
    drained: Notify,
}

impl PoolShared {
    fn idle(&self) -> MutexGuard<'_, VecDeque<PooledConnection>> {
        // A panic while holding the lock cannot leave the deque half-updated
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn open(&self) -> PilotResult<PooledConnection> {
        let conn = self.connector.connect().await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        debug!(connection = id, "Opened pooled connection");
        Ok(PooledConnection::new(id, conn))
    }

    fn discard(&self, mut pooled: PooledConnection) {
        pooled.state = ConnectionState::Closed;
        self.total.fetch_sub(1, Ordering::SeqCst);
        debug!(connection = pooled.id, "Discarding pooled connection");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { pooled.conn.close().await });
        }
    }
}

/// Fixed-size connection pool.
///
/// Cheap to clone; all clones share the same slots.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Eagerly opens `settings.size` connections.
    ///
    /// # Errors
    ///
    /// Fails if any connection cannot be established; connections opened
    /// so far are closed.
    pub async fn initialize(
        settings: &PoolSettings,
        connector: Arc<dyn Connector>,
    ) -> PilotResult<Self> {
        let pool = Self::new_empty(settings, connector);
        let opened =
            futures::future::join_all((0..settings.size).map(|_| pool.shared.open())).await;

        let mut failure = None;
        {
            let mut idle = pool.shared.idle();
            for result in opened {
                match result {
                    Ok(conn) => idle.push_back(conn),
                    Err(e) => failure = Some(e),
                }
            }
        }

        if let Some(e) = failure {
            warn!("Pool initialization failed: {e}");
            pool.close_idle().await;
            return Err(e);
        }

        info!(size = settings.size, "Connection pool ready");
        Ok(pool)
    }

    /// Creates a pool with no open connections; they are opened lazily.
    #[must_use]
    pub fn new_empty(settings: &PoolSettings, connector: Arc<dyn Connector>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                connector,
                slots: Arc::new(Semaphore::new(settings.size)),
                idle: Mutex::new(VecDeque::with_capacity(settings.size)),
                size: settings.size,
                acquire_timeout: settings.acquire_timeout,
                next_id: AtomicU64::new(1),
                total: AtomicUsize::new(0),
                in_use: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                drained: Notify::new(),
            }),
        }
    }

    /// Configured number of slots.
    #[must_use]
    pub fn size(&self) -> usize {
        self.shared.size
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Borrows a connection, waiting up to the acquire timeout.
    ///
    /// # Errors
    ///
    /// Returns [`PilotError::PoolExhausted`] on timeout,
    /// [`PilotError::PoolClosed`] after shutdown, or the connector's error
    /// if a replacement connection cannot be opened.
    pub async fn acquire(&self) -> PilotResult<PoolGuard> {
        if self.is_closed() {
            return Err(PilotError::PoolClosed);
        }

        let started = Instant::now();
        self.shared.waiting.fetch_add(1, Ordering::SeqCst);
        let permit = tokio::time::timeout(
            self.shared.acquire_timeout,
            Arc::clone(&self.shared.slots).acquire_owned(),
        )
        .await;
        self.shared.waiting.fetch_sub(1, Ordering::SeqCst);

        let permit = match permit {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PilotError::PoolClosed),
            Err(_) => {
                let waited_ms = started.elapsed().as_millis() as u64;
                debug!(waited_ms, "Pool acquisition timed out");
                return Err(PilotError::pool_exhausted(waited_ms));
            }
        };

        let mut pooled = match self.take_idle() {
            Some(conn) => conn,
            None => self.shared.open().await?,
        };
        pooled.state = ConnectionState::InUse;
        pooled.last_used = Instant::now();
        self.shared.in_use.fetch_add(1, Ordering::SeqCst);

        Ok(PoolGuard {
            shared: Arc::clone(&self.shared),
            conn: Some(pooled),
            _permit: permit,
        })
    }

    /// Pops the first usable idle connection, discarding dead ones.
    fn take_idle(&self) -> Option<PooledConnection> {
        let mut dead = Vec::new();
        let found = {
            let mut idle = self.shared.idle();
            loop {
                match idle.pop_front() {
                    Some(conn) if conn.is_usable() => break Some(conn),
                    Some(conn) => dead.push(conn),
                    None => break None,
                }
            }
        };
        for conn in dead {
            info!(connection = conn.id, "Replacing unhealthy connection");
            self.shared.discard(conn);
        }
        found
    }

    /// Returns current counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total: self.shared.total.load(Ordering::SeqCst),
            available: self.shared.slots.available_permits(),
            in_use: self.shared.in_use.load(Ordering::SeqCst),
            waiting: self.shared.waiting.load(Ordering::SeqCst),
        }
    }

    /// Lists the server's tools over a pooled connection.
    ///
    /// # Errors
    ///
    /// Returns an error if no connection can be acquired or the listing
    /// fails.
    pub async fn discover_tools(&self) -> PilotResult<Vec<McpTool>> {
        let mut guard = self.acquire().await?;
        let result = guard.connection().list_tools().await;
        if let Err(e) = &result {
            if e.poisons_connection() {
                guard.mark_unhealthy();
            }
        }
        result
    }

    /// Pings every idle connection once, marking failures unhealthy.
    ///
    /// Each probe holds a slot, so probing never lets the pool exceed its
    /// size. Returns the number of connections found unhealthy.
    pub async fn check_health(&self) -> usize {
        self.check_health_idle_for(Duration::ZERO).await
    }

    /// Like [`check_health`](Self::check_health), but skips connections
    /// returned to the pool less than `min_idle` ago.
    pub async fn check_health_idle_for(&self, min_idle: Duration) -> usize {
        let candidates = self.shared.idle().len();
        let mut unhealthy = 0;

        for _ in 0..candidates {
            let Ok(permit) = Arc::clone(&self.shared.slots).try_acquire_owned() else {
                break;
            };
            let next = self.shared.idle().pop_front();
            let Some(mut pooled) = next else {
                break;
            };

            if pooled.last_used().elapsed() < min_idle {
                self.shared.idle().push_back(pooled);
                drop(permit);
                continue;
            }

            let healthy = pooled.conn.is_alive() && pooled.conn.ping().await.is_ok();
            if healthy {
                self.shared.idle().push_back(pooled);
            } else {
                unhealthy += 1;
                pooled.state = ConnectionState::Unhealthy;
                warn!(connection = pooled.id, "Health check failed");
                self.shared.discard(pooled);
            }
            drop(permit);
        }

        unhealthy
    }

    /// Spawns a task that health-checks every `interval` until `cancel`
    /// fires or the pool closes. Connections used within the last interval
    /// are not pinged.
    pub fn spawn_health_monitor(
        &self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if pool.is_closed() {
                            break;
                        }
                        let unhealthy = pool.check_health_idle_for(interval).await;
                        if unhealthy > 0 {
                            info!(unhealthy, "Health check replaced connections");
                        }
                    }
                }
            }
            debug!("Health monitor stopped");
        })
    }

    /// Refuses new acquisitions, waits up to `grace` for borrowed
    /// connections to come back, then closes everything.
    ///
    /// Returns the number of connections still borrowed when the grace
    /// period ran out.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return 0;
        }
        self.shared.slots.close();
        info!("Connection pool shutting down");

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let drained = self.shared.drained.notified();
            if self.shared.in_use.load(Ordering::SeqCst) == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                break;
            }
        }

        self.close_idle().await;
        let abandoned = self.shared.in_use.load(Ordering::SeqCst);
        if abandoned > 0 {
            warn!(abandoned, "Shutdown grace expired with connections in use");
        }
        abandoned
    }

    async fn close_idle(&self) {
        let idle: Vec<_> = self.shared.idle().drain(..).collect();
        for mut pooled in idle {
            pooled.state = ConnectionState::Closed;
            pooled.conn.close().await;
            self.shared.total.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Exclusive borrow of one pooled connection.
///
/// Returned to the pool on drop.
pub struct PoolGuard {
    shared: Arc<PoolShared>,
    conn: Option<PooledConnection>,
    _permit: OwnedSemaphorePermit,
}

impl PoolGuard {
    fn slot(&mut self) -> &mut PooledConnection {
        match self.conn.as_mut() {
            Some(conn) => conn,
            None => unreachable!("pool guard used after release"),
        }
    }

    /// Identifier of the borrowed connection.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.conn.as_ref().map_or(0, PooledConnection::id)
    }

    /// The borrowed connection.
    pub fn connection(&mut self) -> &mut dyn ToolConnection {
        self.slot().conn.as_mut()
    }

    /// Prevents the connection from being reused.
    pub fn mark_unhealthy(&mut self) {
        let slot = self.slot();
        slot.state = ConnectionState::Unhealthy;
        warn!(connection = slot.id, "Connection marked unhealthy");
    }

    /// Returns the connection to the pool.
    pub fn release(self) {
        drop(self);
    }
}

impl std::fmt::Debug for PoolGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard")
            .field("connection", &self.conn)
            .finish_non_exhaustive()
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        let Some(mut pooled) = self.conn.take() else {
            return;
        };
        pooled.last_used = Instant::now();

        let closed = self.shared.closed.load(Ordering::SeqCst);
        if closed || !pooled.is_usable() {
            self.shared.discard(pooled);
        } else {
            pooled.state = ConnectionState::Idle;
            self.shared.idle().push_back(pooled);
        }

        // The permit drops after this body, once the connection is idle again
        if self.shared.in_use.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared.drained.notify_waiters();
        }
    }
}
