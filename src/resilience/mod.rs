//! Resilience helpers.
//!
//! # Data Flow
//! ```text
//! Coordinator hand-off:
//!     connect refused / socket missing
//!     → backoff.rs (jittered exponential delay)
//!     → retry until connected or the cycle is interrupted
//!
//! Accept loop:
//!     accept() error (EMFILE, ENOBUFS, ...)
//!     → backoff.rs pause before accepting again
//! ```
//!
//! # Design Decisions
//! - Interrupted syscalls are retried immediately, never through backoff
//! - Backoff is per call site and reset after a success

pub mod backoff;
