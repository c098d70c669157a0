//! Handler callback contract.
//!
//! A handler is the embedding system's business logic. It runs only on the
//! dispatch thread, one message at a time, so it does not need to be `Send`
//! or `Sync`; interior state can live in `Cell`/`RefCell`.

use thiserror::Error;

use crate::dispatch::outcome::DispatchOutcome;
use crate::http::request::HttpRequest;
use crate::net::connection::ConnectionId;
use crate::net::listener::ListenerId;

/// A fault raised by a handler callback.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn msg(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Business logic invoked by the dispatch loop.
///
/// Every callback runs inside a unit of work: `begin_unit` before,
/// `commit_unit` after success, `rollback_unit` after a fault.
pub trait Handler {
    /// Decide what to do with a request. `Ok(None)` answers 204.
    fn handle_request(
        &self,
        listener: ListenerId,
        request: &HttpRequest,
    ) -> Result<Option<DispatchOutcome>, HandlerError>;

    /// Accept or refuse a WebSocket upgrade. `None` and `false` both abort.
    fn websocket_upgrade(
        &self,
        _listener: ListenerId,
        _connection: ConnectionId,
        _request: &HttpRequest,
    ) -> Result<Option<bool>, HandlerError> {
        Ok(Some(false))
    }

    fn websocket_open(&self, _connection: ConnectionId) -> Result<(), HandlerError> {
        Ok(())
    }

    fn websocket_message(
        &self,
        _connection: ConnectionId,
        _payload: &[u8],
        _binary: bool,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    fn websocket_close(&self, _connection: ConnectionId) -> Result<(), HandlerError> {
        Ok(())
    }

    fn begin_unit(&self) -> Result<(), HandlerError> {
        Ok(())
    }

    fn commit_unit(&self) -> Result<(), HandlerError> {
        Ok(())
    }

    fn rollback_unit(&self) -> Result<(), HandlerError> {
        Ok(())
    }
}

impl<H: Handler + ?Sized> Handler for Box<H> {
    fn handle_request(
        &self,
        listener: ListenerId,
        request: &HttpRequest,
    ) -> Result<Option<DispatchOutcome>, HandlerError> {
        (**self).handle_request(listener, request)
    }

    fn websocket_upgrade(
        &self,
        listener: ListenerId,
        connection: ConnectionId,
        request: &HttpRequest,
    ) -> Result<Option<bool>, HandlerError> {
        (**self).websocket_upgrade(listener, connection, request)
    }

    fn websocket_open(&self, connection: ConnectionId) -> Result<(), HandlerError> {
        (**self).websocket_open(connection)
    }

    fn websocket_message(
        &self,
        connection: ConnectionId,
        payload: &[u8],
        binary: bool,
    ) -> Result<(), HandlerError> {
        (**self).websocket_message(connection, payload, binary)
    }

    fn websocket_close(&self, connection: ConnectionId) -> Result<(), HandlerError> {
        (**self).websocket_close(connection)
    }

    fn begin_unit(&self) -> Result<(), HandlerError> {
        (**self).begin_unit()
    }

    fn commit_unit(&self) -> Result<(), HandlerError> {
        (**self).commit_unit()
    }

    fn rollback_unit(&self) -> Result<(), HandlerError> {
        (**self).rollback_unit()
    }
}
