//! Concurrent HTTP dispatch worker.
//!
//! Decouples network I/O from business logic: a network loop thread accepts
//! connections and turns requests into envelopes, the dispatch loop runs the
//! embedding system's handler one envelope at a time, and listening sockets
//! handed off by a coordinator are reconciled live on reload.

pub mod config;
pub mod dispatch;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod resilience;

pub use config::schema::WorkerConfig;
pub use dispatch::{DispatchOutcome, Handler, HandlerError, HttpResponse, ProxyTarget};
pub use http::{HttpMethod, HttpRequest, SessionRegistry};
pub use lifecycle::{LoopPhase, Worker, WorkerError, WorkerHandle};
pub use net::{ConnectionId, ListenerId};
