//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! coordinator (Unix socket, SCM_RIGHTS)
//!     → handoff.rs (receive (fd, master-fd) pairs)
//!     → registry.rs (reconcile against the active set)
//!     → listener.rs (ListenerContext per socket, bound into the network loop)
//!     → connection.rs (per-connection identity and drain tracking)
//!     → HTTP layer
//! ```
//!
//! # Design Decisions
//! - Master-fd is the identity of a socket across reloads, never the local fd
//! - Listener sockets are only touched while the network loop is suspended
//! - Each connection is tracked so shutdown can drain it

pub mod connection;
pub mod handoff;
pub mod listener;
pub mod registry;

pub use connection::{ConnectionId, ConnectionTracker};
pub use handoff::{CoordinatorClient, FdSource, Handoff, HandoffError};
pub use listener::{ListenerContext, ListenerFd, ListenerId, MasterFd};
pub use registry::{ListenerBinder, ListenerRegistry, ReconcileReport, ReconciliationSnapshot};
