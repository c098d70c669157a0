//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Worker (worker.rs):
//!     build context → spawn network loop → pump dispatch queue
//!     reload flag → catalog → ready → hand-off → suspend → reconcile → resume
//!
//! Control (control.rs):
//!     flags + phase state machine shared by both loops
//!
//! Signals (signals.rs):
//!     SIGHUP → request reload
//!     SIGTERM/SIGINT → request shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: suspend, release listeners, close sessions, drain
//! - Draining has a deadline; remaining connections are closed after it

pub mod control;
pub mod readiness;
pub mod signals;
pub mod worker;

pub use control::{LoopControl, LoopPhase};
pub use readiness::{Readiness, ReadinessCounter};
pub use signals::{spawn_signal_thread, SignalThread};
pub use worker::{Worker, WorkerBuilder, WorkerContext, WorkerError, WorkerHandle};
