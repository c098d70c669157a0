//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → WorkerConfig (validated, immutable)
//!     → [[listeners]] rows → catalog.rs (SharedCatalog)
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → catalog rows replaced
//!     → reload requested (same path as the reload signal)
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; only catalog rows follow file changes
//! - All fields have defaults to allow minimal configs
//! - Catalog reads never block: a held lock is a retryable condition

pub mod catalog;
pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use catalog::{CatalogError, ListenerCatalog, SharedCatalog};
pub use loader::{load_config, ConfigError};
pub use watcher::ConfigWatcher;
pub use schema::{
    CoordinatorConfig, DispatchConfig, HttpConfig, LifecycleConfig, ListenerEntry, LogFormat,
    ObservabilityConfig, WorkerConfig,
};
