//! Stdio transport for MCP servers.
//!
//! The server is a child process speaking newline-delimited JSON-RPC on its
//! stdin/stdout. A writer task serializes outgoing frames; a reader task
//! routes responses to the waiting request by id and progress
//! notifications to their listener.
//!
//! When the reader sees EOF or a read error the transport is marked dead
//! and every pending request fails with a transport error. The pool uses
//! [`Transport::is_alive`] to discard such connections.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};

use crate::error::{PilotError, PilotResult};
use crate::mcp::protocol::{IncomingMessage, JsonRpcRequest, JsonRpcResponse, ProgressParams};

/// Transport trait for MCP communication.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Starts the transport connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be started.
    async fn start(&mut self) -> PilotResult<()>;

    /// Stops the transport connection.
    async fn stop(&mut self);

    /// Sends a request and waits for its response.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the request cannot be sent, the
    /// connection dies, or no response arrives within `timeout`.
    async fn send_request(
        &mut self,
        request: JsonRpcRequest,
        timeout: Duration,
    ) -> PilotResult<JsonRpcResponse>;

    /// Sends a notification (no response expected).
    ///
    /// # Errors
    ///
    /// Returns a transport error if the notification cannot be sent.
    async fn send_notification(&mut self, notification: JsonRpcRequest) -> PilotResult<()>;

    /// Returns false once the connection is known to be dead.
    fn is_alive(&self) -> bool;
}

/// Message sent to the writer task.
enum WriterMessage {
    Send { data: String },
    Stop,
}

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<PilotResult<JsonRpcResponse>>>>>;
type ProgressMap = Arc<Mutex<HashMap<i64, mpsc::UnboundedSender<u8>>>>;

/// Stdio transport for MCP servers.
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    child: Option<Child>,
    writer_tx: Option<mpsc::Sender<WriterMessage>>,
    pending: PendingMap,
    progress: ProgressMap,
    alive: Arc<AtomicBool>,
}

impl StdioTransport {
    /// Creates a new stdio transport.
    #[must_use]
    pub fn new(command: impl Into<String>, args: Vec<String>, env: HashMap<String, String>) -> Self {
        Self {
            command: command.into(),
            args,
            env,
            child: None,
            writer_tx: None,
            pending: Arc::new(Mutex::new(HashMap::new())),
            progress: Arc::new(Mutex::new(HashMap::new())),
            alive: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Routes progress notifications carrying `token` to `tx`.
    pub async fn register_progress(&self, token: i64, tx: mpsc::UnboundedSender<u8>) {
        self.progress.lock().await.insert(token, tx);
    }

    /// Stops routing progress notifications for `token`.
    pub async fn unregister_progress(&self, token: i64) {
        self.progress.lock().await.remove(&token);
    }

    async fn spawn_and_start(&mut self) -> PilotResult<()> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PilotError::transport(format!("failed to spawn '{}': {e}", self.command))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PilotError::transport("child has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PilotError::transport("child has no stdout"))?;
        let stderr = child.stderr.take();

        self.child = Some(child);
        self.alive.store(true, Ordering::SeqCst);

        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterMessage>(32);
        self.writer_tx = Some(writer_tx);

        // Writer task
        let alive = Arc::clone(&self.alive);
        let mut stdin = stdin;
        tokio::spawn(async move {
            while let Some(msg) = writer_rx.recv().await {
                match msg {
                    WriterMessage::Send { data } => {
                        let write = async {
                            stdin.write_all(data.as_bytes()).await?;
                            stdin.write_all(b"\n").await?;
                            stdin.flush().await
                        };
                        if let Err(e) = write.await {
                            error!("Failed to write to MCP server stdin: {e}");
                            alive.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                    WriterMessage::Stop => break,
                }
            }
        });

        // Reader task
        let pending = Arc::clone(&self.pending);
        let progress = Arc::clone(&self.progress);
        let alive = Arc::clone(&self.alive);
        let mut reader = BufReader::new(stdout);
        tokio::spawn(async move {
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        debug!("MCP server closed stdout");
                        break;
                    }
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        route_line(trimmed, &pending, &progress).await;
                    }
                    Err(e) => {
                        error!("Failed to read from MCP server stdout: {e}");
                        break;
                    }
                }
            }

            alive.store(false, Ordering::SeqCst);
            let mut pending = pending.lock().await;
            for (_, tx) in pending.drain() {
                let _ = tx.send(Err(PilotError::transport("server closed the connection")));
            }
        });

        // Server diagnostics go to our log, never to the protocol stream
        if let Some(stderr) = stderr {
            let command = self.command.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %command, "{line}");
                }
            });
        }

        Ok(())
    }
}

async fn route_line(line: &str, pending: &PendingMap, progress: &ProgressMap) {
    match IncomingMessage::parse(line) {
        Ok(IncomingMessage::Response(response)) => {
            let Some(id) = response.numeric_id() else {
                warn!("MCP response without numeric id: {line}");
                return;
            };
            if let Some(tx) = pending.lock().await.remove(&id) {
                let _ = tx.send(Ok(response));
            } else {
                // Late answer to a request we stopped waiting for
                debug!(id, "Dropping response for unknown request");
            }
        }
        Ok(IncomingMessage::Notification { method, params }) => {
            if method != "notifications/progress" {
                debug!(method = %method, "Ignoring MCP notification");
                return;
            }
            match serde_json::from_value::<ProgressParams>(params) {
                Ok(update) => {
                    let Some(token) = update.progress_token.as_i64() else {
                        return;
                    };
                    if let Some(tx) = progress.lock().await.get(&token) {
                        let _ = tx.send(update.percent());
                    }
                }
                Err(e) => warn!("Malformed progress notification: {e}"),
            }
        }
        Err(e) => warn!("Failed to parse MCP message: {e}, line: {line}"),
    }
}

impl Transport for StdioTransport {
    async fn start(&mut self) -> PilotResult<()> {
        if self.child.is_some() {
            return Err(PilotError::invalid_state("transport already started"));
        }
        self.spawn_and_start().await
    }

    async fn stop(&mut self) {
        if let Some(tx) = self.writer_tx.take() {
            let _ = tx.send(WriterMessage::Stop).await;
        }

        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }

        self.alive.store(false, Ordering::SeqCst);
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(PilotError::transport("transport stopped")));
        }
    }

    async fn send_request(
        &mut self,
        request: JsonRpcRequest,
        timeout: Duration,
    ) -> PilotResult<JsonRpcResponse> {
        if !self.is_alive() {
            return Err(PilotError::transport("connection is closed"));
        }
        let tx = self
            .writer_tx
            .as_ref()
            .ok_or_else(|| PilotError::transport("transport not started"))?;
        let id = request
            .id()
            .ok_or_else(|| PilotError::protocol("request has no id"))?;

        let (response_tx, response_rx) = oneshot::channel();
        self.pending.lock().await.insert(id, response_tx);

        let data = serde_json::to_string(&request)?;
        if tx.send(WriterMessage::Send { data }).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(PilotError::transport("writer task closed"));
        }

        match tokio::time::timeout(timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PilotError::transport("response channel closed")),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(PilotError::transport(format!(
                    "no response to '{}' within {} ms",
                    request.method(),
                    timeout.as_millis()
                )))
            }
        }
    }

    async fn send_notification(&mut self, notification: JsonRpcRequest) -> PilotResult<()> {
        let tx = self
            .writer_tx
            .as_ref()
            .ok_or_else(|| PilotError::transport("transport not started"))?;
        let data = serde_json::to_string(&notification)?;
        tx.send(WriterMessage::Send { data })
            .await
            .map_err(|_| PilotError::transport("writer task closed"))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}
