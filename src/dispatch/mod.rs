//! Dispatch subsystem: everything that runs on the dispatch thread.
//!
//! # Data Flow
//! ```text
//! network loop
//!     → envelope.rs (MessageEnvelope onto the FIFO dispatch queue)
//!     → dispatcher.rs (one envelope at a time)
//!     → unit_of_work.rs (begin → handler callback → commit | rollback)
//!     → handler.rs (embedding system's business logic)
//!     → outcome.rs (DispatchOutcome back through the envelope's lease)
//!     → network loop renders it
//! ```
//!
//! # Design Decisions
//! - Message kinds are a closed enum matched exhaustively
//! - Handler faults and panics never leave the unit-of-work boundary
//! - No concurrent handler invocation within one worker

pub mod dispatcher;
pub mod envelope;
pub mod handler;
pub mod outcome;
pub mod unit_of_work;

pub use dispatcher::{Dispatcher, PumpExit};
pub use envelope::{
    dispatch_queue, ConnectionLease, DispatchQueue, DispatchReceiver, HttpEnvelope,
    MessageEnvelope,
};
pub use handler::{Handler, HandlerError};
pub use outcome::{DispatchOutcome, HttpResponse, ProxyTarget};
