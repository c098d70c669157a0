//! The dispatch loop.
//!
//! # Responsibilities
//! - Take envelopes off the queue one at a time, in order
//! - Invoke the matching handler callback inside a unit of work
//! - Send the decision back through the envelope's lease
//! - Contain handler faults: roll back, substitute a failure, keep going
//!
//! # Design Decisions
//! - Handlers are synchronous and run on this thread; a slow handler delays
//!   every message behind it
//! - The loop returns to its caller when a reload or shutdown is requested so
//!   the caller can run the reconciliation cycle on the same thread

use std::time::Instant;

use crate::dispatch::envelope::{Dequeued, DispatchReceiver, HttpEnvelope, MessageEnvelope};
use crate::dispatch::handler::{Handler, HandlerError};
use crate::dispatch::outcome::{DispatchOutcome, HttpResponse};
use crate::dispatch::unit_of_work;
use crate::http::websocket::SessionRegistry;
use crate::lifecycle::control::LoopControl;
use crate::net::connection::ConnectionId;
use crate::net::listener::ListenerId;
use crate::observability::metrics;

/// Why [`Dispatcher::pump`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    Reload,
    Shutdown,
    /// Every sender of the queue is gone.
    Closed,
}

/// Runs handler callbacks for queued envelopes.
pub struct Dispatcher<H> {
    handler: H,
    sessions: SessionRegistry,
}

impl<H: Handler> Dispatcher<H> {
    pub fn new(handler: H, sessions: SessionRegistry) -> Self {
        Self { handler, sessions }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Process envelopes until a reload or shutdown is requested.
    ///
    /// When `retry_at` passes, a reload is requested on the caller's behalf.
    pub async fn pump(
        &self,
        rx: &mut DispatchReceiver,
        control: &LoopControl,
        retry_at: Option<tokio::time::Instant>,
    ) -> PumpExit {
        let mut retry_at = retry_at;
        loop {
            if !control.is_running() {
                return PumpExit::Shutdown;
            }
            if control.reload_requested() {
                return PumpExit::Reload;
            }

            let item = match retry_at {
                Some(deadline) => tokio::select! {
                    item = rx.recv() => item,
                    _ = tokio::time::sleep_until(deadline) => {
                        retry_at = None;
                        tracing::debug!("Retrying deferred reload");
                        control.request_reload();
                        continue;
                    }
                },
                None => rx.recv().await,
            };

            match item {
                Some(Dequeued::Message(envelope)) => self.dispatch(envelope),
                Some(Dequeued::Wake) => {}
                None => return PumpExit::Closed,
            }
        }
    }

    /// Handle one envelope to completion.
    pub fn dispatch(&self, envelope: MessageEnvelope) {
        let kind = envelope.kind();
        metrics::record_dispatch(kind);

        match envelope {
            MessageEnvelope::HttpRequest(http) => self.dispatch_http(http),
            MessageEnvelope::WebSocketOpen { connection_id } => {
                self.dispatch_event(kind, connection_id, |h| h.websocket_open(connection_id))
            }
            MessageEnvelope::WebSocketMessage {
                connection_id,
                payload,
                binary,
            } => self.dispatch_event(kind, connection_id, |h| {
                h.websocket_message(connection_id, &payload, binary)
            }),
            MessageEnvelope::WebSocketClose { connection_id } => {
                self.dispatch_event(kind, connection_id, |h| h.websocket_close(connection_id))
            }
        }
    }

    fn dispatch_http(&self, envelope: HttpEnvelope) {
        let HttpEnvelope {
            listener,
            request,
            websocket,
            lease,
        } = envelope;

        if lease.is_connection_gone() {
            tracing::debug!(path = %request.path, "Connection gone before dispatch, skipping handler");
            return;
        }

        let listener_id = listener.listener_id().unwrap_or(ListenerId::UNASSIGNED);
        let started = Instant::now();

        let result = match websocket {
            Some(connection_id) => unit_of_work::run(&self.handler, |h| {
                h.websocket_upgrade(listener_id, connection_id, &request)
            })
            .map(|decision| match decision {
                Some(accept) => DispatchOutcome::WebSocketUpgradeDecision(accept),
                None => DispatchOutcome::Abort,
            }),
            None => unit_of_work::run(&self.handler, |h| h.handle_request(listener_id, &request))
                .map(|outcome| {
                    outcome.unwrap_or_else(|| DispatchOutcome::Response(HttpResponse::no_content()))
                }),
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                metrics::record_handler_fault("http");
                tracing::warn!(
                    listener_id = %listener_id,
                    method = %request.method,
                    path = %request.path,
                    error = %e,
                    "Handler fault, unit of work rolled back"
                );
                DispatchOutcome::Fail(e.to_string())
            }
        };

        tracing::debug!(
            listener_id = %listener_id,
            method = %request.method,
            path = %request.path,
            outcome = outcome.kind(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "Request dispatched"
        );

        if !lease.complete(outcome) {
            tracing::debug!(path = %request.path, "Connection closed before the outcome was delivered");
        }
    }

    fn dispatch_event<F>(&self, kind: &'static str, connection_id: ConnectionId, f: F)
    where
        F: FnOnce(&H) -> Result<(), HandlerError>,
    {
        if let Err(e) = unit_of_work::run(&self.handler, f) {
            metrics::record_handler_fault(kind);
            tracing::warn!(
                connection_id = %connection_id,
                event = kind,
                error = %e,
                "WebSocket handler fault, aborting session"
            );
            self.sessions.abort(connection_id);
        }
    }
}
