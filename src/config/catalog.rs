//! Listener catalog: the configuration-store query consumed by reconciliation.
//!
//! The catalog answers one question: which logical listeners exist, in id
//! order. Reads take a shared lock and never wait for it. A lock held by an
//! exclusive operation makes the query fail with [`CatalogError::Locked`],
//! which callers treat as "try again later" instead of blocking behind an
//! operation that may itself be waiting for this worker.

use std::sync::{RwLock, RwLockWriteGuard, TryLockError};

use thiserror::Error;

use crate::config::schema::WorkerConfig;
use crate::net::listener::ListenerId;

/// Error type for catalog queries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    /// Another party holds the catalog exclusively.
    #[error("listener catalog is locked")]
    Locked,

    /// The catalog could not be read at all.
    #[error("listener catalog unavailable: {0}")]
    Unavailable(String),
}

impl CatalogError {
    /// Whether the query should simply be retried on a later cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CatalogError::Locked)
    }
}

/// Query interface over the persistent listener configuration.
pub trait ListenerCatalog: Send + Sync {
    /// Logical listener ids ordered ascending; one row per physical socket.
    fn listener_ids(&self) -> Result<Vec<ListenerId>, CatalogError>;
}

/// In-process catalog guarded by a read/write lock.
#[derive(Debug, Default)]
pub struct SharedCatalog {
    rows: RwLock<Vec<ListenerId>>,
}

impl SharedCatalog {
    /// Create a catalog with the given rows.
    pub fn new(rows: Vec<ListenerId>) -> Self {
        Self { rows: RwLock::new(rows) }
    }

    /// Create a catalog from the `[[listeners]]` section of a config.
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(rows_from_config(config))
    }

    /// Replace all rows (e.g., after the config file changed).
    pub fn replace(&self, rows: Vec<ListenerId>) -> Result<(), CatalogError> {
        let mut guard = self.lock_exclusive()?;
        *guard = rows;
        Ok(())
    }

    /// Take the catalog exclusively. Queries fail with `Locked` until the guard drops.
    pub fn lock_exclusive(&self) -> Result<RwLockWriteGuard<'_, Vec<ListenerId>>, CatalogError> {
        self.rows
            .write()
            .map_err(|e| CatalogError::Unavailable(e.to_string()))
    }
}

impl ListenerCatalog for SharedCatalog {
    fn listener_ids(&self) -> Result<Vec<ListenerId>, CatalogError> {
        match self.rows.try_read() {
            Ok(rows) => {
                let mut ids = rows.clone();
                ids.sort();
                Ok(ids)
            }
            Err(TryLockError::WouldBlock) => Err(CatalogError::Locked),
            Err(TryLockError::Poisoned(e)) => Err(CatalogError::Unavailable(e.to_string())),
        }
    }
}

/// Catalog rows described by a config file.
pub fn rows_from_config(config: &WorkerConfig) -> Vec<ListenerId> {
    config.listeners.iter().map(|l| ListenerId::new(l.id)).collect()
}
