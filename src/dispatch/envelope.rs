//! Message envelopes and the dispatch queue.
//!
//! # Design Decisions
//! - One closed enum for every kind of work crossing to the dispatch thread
//! - An HTTP envelope carries a `ConnectionLease`: the network side keeps the
//!   connection open until the lease is completed or dropped
//! - The queue is unbounded and FIFO; `None` on the channel is a wake-up
//!   that carries no work

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::dispatch::outcome::DispatchOutcome;
use crate::http::request::HttpRequest;
use crate::net::connection::ConnectionId;
use crate::net::listener::ListenerContext;
use crate::observability::metrics;

/// Reply slot for one dispatched HTTP request.
///
/// Dropping the lease without completing it aborts the connection.
#[derive(Debug)]
pub struct ConnectionLease {
    reply: oneshot::Sender<DispatchOutcome>,
}

/// The network side of a lease.
pub type PendingOutcome = oneshot::Receiver<DispatchOutcome>;

impl ConnectionLease {
    pub fn new() -> (Self, PendingOutcome) {
        let (reply, pending) = oneshot::channel();
        (Self { reply }, pending)
    }

    /// True once the client connection has gone away.
    pub fn is_connection_gone(&self) -> bool {
        self.reply.is_closed()
    }

    /// Hand the outcome back. Returns false if nobody is waiting for it.
    pub fn complete(self, outcome: DispatchOutcome) -> bool {
        self.reply.send(outcome).is_ok()
    }
}

/// A completed HTTP request waiting for a handler decision.
#[derive(Debug)]
pub struct HttpEnvelope {
    /// Listener the connection was accepted on. Its id is read at dispatch time.
    pub listener: Arc<ListenerContext>,
    pub request: HttpRequest,
    /// Set when the request asks for a WebSocket upgrade.
    pub websocket: Option<ConnectionId>,
    pub lease: ConnectionLease,
}

/// Work for the dispatch loop.
#[derive(Debug)]
pub enum MessageEnvelope {
    HttpRequest(HttpEnvelope),
    WebSocketOpen {
        connection_id: ConnectionId,
    },
    WebSocketMessage {
        connection_id: ConnectionId,
        payload: Bytes,
        binary: bool,
    },
    WebSocketClose {
        connection_id: ConnectionId,
    },
}

impl MessageEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageEnvelope::HttpRequest(_) => "http",
            MessageEnvelope::WebSocketOpen { .. } => "websocket_open",
            MessageEnvelope::WebSocketMessage { .. } => "websocket_message",
            MessageEnvelope::WebSocketClose { .. } => "websocket_close",
        }
    }
}

/// Item taken off the dispatch queue.
#[derive(Debug)]
pub enum Dequeued {
    Message(MessageEnvelope),
    Wake,
}

/// Sending half of the dispatch queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DispatchQueue {
    tx: mpsc::UnboundedSender<Option<MessageEnvelope>>,
    depth: Arc<AtomicUsize>,
}

/// Receiving half, owned by the dispatch loop.
#[derive(Debug)]
pub struct DispatchReceiver {
    rx: mpsc::UnboundedReceiver<Option<MessageEnvelope>>,
    depth: Arc<AtomicUsize>,
}

/// Create a connected queue pair.
pub fn dispatch_queue() -> (DispatchQueue, DispatchReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        DispatchQueue {
            tx,
            depth: Arc::clone(&depth),
        },
        DispatchReceiver { rx, depth },
    )
}

impl DispatchQueue {
    /// Enqueue an envelope. Gives it back if the dispatch loop is gone.
    pub fn send(&self, envelope: MessageEnvelope) -> Result<(), MessageEnvelope> {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        match self.tx.send(Some(envelope)) {
            Ok(()) => {
                metrics::set_queue_depth(depth);
                Ok(())
            }
            Err(mpsc::error::SendError(item)) => {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                match item {
                    Some(envelope) => Err(envelope),
                    None => Ok(()),
                }
            }
        }
    }

    /// Post a wake-up so the dispatch loop re-checks its flags.
    pub fn wake(&self) {
        let _ = self.tx.send(None);
    }

    /// Envelopes sent but not yet taken.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl DispatchReceiver {
    /// Next item in FIFO order, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Dequeued> {
        let item = self.rx.recv().await?;
        Some(self.account(item))
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Dequeued> {
        let item = self.rx.try_recv().ok()?;
        Some(self.account(item))
    }

    /// Stop accepting envelopes. Already queued items can still be taken.
    pub fn close(&mut self) {
        self.rx.close();
    }

    fn account(&self, item: Option<MessageEnvelope>) -> Dequeued {
        match item {
            Some(envelope) => {
                let depth = self.depth.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
                metrics::set_queue_depth(depth);
                Dequeued::Message(envelope)
            }
            None => Dequeued::Wake,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(id: ConnectionId) -> MessageEnvelope {
        MessageEnvelope::WebSocketOpen { connection_id: id }
    }

    #[tokio::test]
    async fn delivers_in_fifo_order_with_wakes_interleaved() {
        let (queue, mut rx) = dispatch_queue();
        let ids: Vec<ConnectionId> = (0..3).map(|_| ConnectionId::new()).collect();

        queue.send(open(ids[0])).unwrap();
        queue.wake();
        queue.send(open(ids[1])).unwrap();
        queue.send(open(ids[2])).unwrap();
        assert_eq!(queue.depth(), 3);

        let mut seen = Vec::new();
        let mut wakes = 0;
        while let Some(item) = rx.try_recv() {
            match item {
                Dequeued::Message(MessageEnvelope::WebSocketOpen { connection_id }) => {
                    seen.push(connection_id)
                }
                Dequeued::Message(other) => panic!("unexpected {}", other.kind()),
                Dequeued::Wake => wakes += 1,
            }
        }

        assert_eq!(seen, ids);
        assert_eq!(wakes, 1);
        assert_eq!(queue.depth(), 0);
    }

    #[test]
    fn send_after_close_returns_envelope() {
        let (queue, mut rx) = dispatch_queue();
        rx.close();
        let id = ConnectionId::new();

        match queue.send(open(id)) {
            Err(MessageEnvelope::WebSocketOpen { connection_id }) => assert_eq!(connection_id, id),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn lease_reports_closed_connection() {
        let (lease, pending) = ConnectionLease::new();
        assert!(!lease.is_connection_gone());

        drop(pending);
        assert!(lease.is_connection_gone());
        assert!(!lease.complete(DispatchOutcome::Abort));
    }

    #[tokio::test]
    async fn lease_delivers_outcome() {
        let (lease, pending) = ConnectionLease::new();
        assert!(lease.complete(DispatchOutcome::WebSocketUpgradeDecision(true)));
        assert_eq!(
            pending.await.unwrap(),
            DispatchOutcome::WebSocketUpgradeDecision(true)
        );
    }
}
