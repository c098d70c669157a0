//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection (accepted on a reconciled listener)
//!     → server.rs (hyper-util auto builder, HTTP/1.1 + HTTP/2, upgrades)
//!     → request.rs (method check, path normalization, request record)
//!     → dispatch queue → handler on the dispatch thread
//!     → outcome:
//!         Response         → response.rs (status default, Content-Length policy)
//!         Proxy            → proxy.rs (relay to upstream)
//!         Upgrade accepted → websocket.rs (session task)
//!         Abort / Fail     → close / 500
//! ```

pub mod proxy;
pub mod request;
pub mod response;
pub mod server;
pub mod websocket;

pub use request::{HttpMethod, HttpRequest};
pub use server::{ConnectionAbort, NetworkBinder, NetworkLoop, ServiceState};
pub use websocket::{SessionCommand, SessionRegistry};
