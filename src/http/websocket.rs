//! WebSocket upgrade handling and live sessions.
//!
//! # Responsibilities
//! - Answer an accepted upgrade with `101 Switching Protocols`
//! - Run one session task per upgraded connection on the network loop
//! - Turn frames into open/message/close envelopes for the dispatch loop
//! - Let any thread push frames to, close, or abort a session by id
//!
//! # Data Flow
//! ```text
//! client frames ──▶ session task ──▶ MessageEnvelope ──▶ dispatch loop
//! SessionRegistry ──▶ SessionCommand ──▶ session task ──▶ client frames
//! ```
//!
//! # Design Decisions
//! - The connection id is assigned when the upgrade request arrives and is
//!   the session identity for every later event
//! - Ping/pong is answered by tungstenite itself
//! - A closed session always produces exactly one close envelope

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, HeaderValue, Response, StatusCode};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::dispatch::envelope::{DispatchQueue, MessageEnvelope};
use crate::http::response;
use crate::net::connection::{ConnectionGuard, ConnectionId};
use crate::observability::metrics;

/// Instruction for a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Text(String),
    Binary(Bytes),
    /// Send a close frame and end the session.
    Close,
    /// Drop the connection without a close handshake.
    Abort,
}

/// Live sessions by connection id. Cheap to clone; usable from any thread.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<ConnectionId, mpsc::UnboundedSender<SessionCommand>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: ConnectionId, commands: mpsc::UnboundedSender<SessionCommand>) {
        self.sessions.insert(id, commands);
    }

    pub fn unregister(&self, id: ConnectionId) {
        self.sessions.remove(&id);
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Queue a command. Returns false if the session is gone.
    pub fn command(&self, id: ConnectionId, command: SessionCommand) -> bool {
        self.sessions
            .get(&id)
            .map(|tx| tx.send(command).is_ok())
            .unwrap_or(false)
    }

    pub fn send_text(&self, id: ConnectionId, text: impl Into<String>) -> bool {
        self.command(id, SessionCommand::Text(text.into()))
    }

    pub fn send_binary(&self, id: ConnectionId, data: impl Into<Bytes>) -> bool {
        self.command(id, SessionCommand::Binary(data.into()))
    }

    pub fn close(&self, id: ConnectionId) -> bool {
        self.command(id, SessionCommand::Close)
    }

    pub fn abort(&self, id: ConnectionId) -> bool {
        self.command(id, SessionCommand::Abort)
    }

    /// Ask every live session to close. Returns how many were asked.
    pub fn close_all(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().send(SessionCommand::Close).is_ok())
            .count()
    }
}

/// `Sec-WebSocket-Accept` value for an upgrade request, if it has a key.
pub fn accept_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::SEC_WEBSOCKET_KEY)
        .map(|key| derive_accept_key(key.as_bytes()))
}

/// The `101` response completing the handshake.
pub fn switching_protocols(accept: &str, server_name: &str) -> Option<Response<Body>> {
    let accept = HeaderValue::from_str(accept).ok()?;
    let mut out = Response::new(Body::empty());
    *out.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = out.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
    response::stamp_server(&mut out, server_name);
    Some(out)
}

/// Drive one upgraded connection until either side ends it.
pub async fn run_session(
    upgraded: Upgraded,
    connection_id: ConnectionId,
    queue: DispatchQueue,
    sessions: SessionRegistry,
    _guard: ConnectionGuard,
) {
    let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
    serve_session(ws, connection_id, queue, sessions).await;
}

/// Session loop over an established WebSocket stream.
pub async fn serve_session<S>(
    mut ws: WebSocketStream<S>,
    connection_id: ConnectionId,
    queue: DispatchQueue,
    sessions: SessionRegistry,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (tx, mut commands) = mpsc::unbounded_channel();
    sessions.register(connection_id, tx);
    metrics::websocket_session_opened();
    tracing::debug!(connection_id = %connection_id, "WebSocket session opened");

    let mut open = queue
        .send(MessageEnvelope::WebSocketOpen { connection_id })
        .is_ok();

    while open {
        tokio::select! {
            frame = ws.next() => {
                let (payload, binary) = match frame {
                    Some(Ok(Message::Text(text))) => (Bytes::copy_from_slice(text.as_bytes()), false),
                    Some(Ok(Message::Binary(data))) => (data, true),
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(connection_id = %connection_id, error = %e, "WebSocket read error");
                        break;
                    }
                };
                open = queue
                    .send(MessageEnvelope::WebSocketMessage { connection_id, payload, binary })
                    .is_ok();
            }
            command = commands.recv() => {
                let result = match command {
                    Some(SessionCommand::Text(text)) => ws.send(Message::text(text)).await,
                    Some(SessionCommand::Binary(data)) => ws.send(Message::binary(data)).await,
                    Some(SessionCommand::Close) => {
                        let _ = ws.close(None).await;
                        break;
                    }
                    Some(SessionCommand::Abort) | None => break,
                };
                if let Err(e) = result {
                    tracing::debug!(connection_id = %connection_id, error = %e, "WebSocket write error");
                    break;
                }
            }
        }
    }

    sessions.unregister(connection_id);
    metrics::websocket_session_closed();
    tracing::debug!(connection_id = %connection_id, "WebSocket session closed");
    let _ = queue.send(MessageEnvelope::WebSocketClose { connection_id });
}
