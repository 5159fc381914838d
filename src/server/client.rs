//! One WebSocket client connection.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::error::PilotError;
use crate::orchestrator::{ClientHandle, Orchestrator};
use crate::types::{ClientMessage, EventSink, ServerEvent};

/// Runs a connection until either side closes it.
///
/// Every message the client started is cancelled when the socket closes.
pub async fn handle_socket(
    socket: WebSocket,
    peer: String,
    orchestrator: Arc<Orchestrator>,
    heartbeat: Duration,
) {
    let (sink, rx) = EventSink::channel();
    let client = ClientHandle::new(peer, sink);
    info!(client = %client.id, "WebSocket client connected");

    let (ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(write_events(ws_tx, rx, heartbeat));

    while let Some(frame) = ws_rx.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!(client = %client.id, "WebSocket read failed: {e}");
                break;
            }
        };
        match frame {
            WsMessage::Text(text) => handle_frame(&orchestrator, &client, text.as_str()),
            WsMessage::Close(_) => break,
            WsMessage::Pong(_) => trace!(client = %client.id, "Pong"),
            _ => {}
        }
    }

    orchestrator.disconnect(&client);
    writer.abort();
    info!(client = %client.id, "WebSocket client disconnected");
}

/// Forwards events to the socket and pings it every `heartbeat`.
async fn write_events(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::UnboundedReceiver<ServerEvent>,
    heartbeat: Duration,
) {
    let mut ping = tokio::time::interval(heartbeat);
    ping.tick().await;

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(event = event.name(), "Failed to encode event: {e}");
                        continue;
                    }
                };
                if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Dispatches one client frame.
pub fn handle_frame(orchestrator: &Arc<Orchestrator>, client: &ClientHandle, text: &str) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(client = %client.id, "Malformed frame: {e}");
            client.sink.emit(ServerEvent::Error {
                error: format!("invalid message: {e}"),
            });
            return;
        }
    };

    match message {
        ClientMessage::Submit {
            text,
            model,
            session_id,
        } => {
            let submitted = orchestrator.submit_message(client, text, model, session_id);
            match submitted {
                Ok(_) | Err(PilotError::RateLimited { .. }) => {}
                Err(e) => {
                    client.sink.emit(ServerEvent::Error {
                        error: e.user_message(),
                    });
                }
            }
        }
        ClientMessage::ApprovalResponse {
            id,
            approved,
            always,
            reason,
        } => {
            if let Err(e) = orchestrator.respond_approval(&id, approved, always, reason) {
                debug!(client = %client.id, approval = %id, "Approval response rejected: {e}");
                client.sink.emit(ServerEvent::Error {
                    error: format!("unknown or expired approval {id}"),
                });
            }
        }
        ClientMessage::Cancel { message_id } => {
            if !orchestrator.cancel_message(&message_id) {
                debug!(client = %client.id, message = %message_id, "Cancel for a message that is not running");
            }
        }
    }
}
