//! Readiness handshake with a governing process.
//!
//! Each reload cycle marks the worker ready after the catalog was read and
//! before listener sockets are taken over, so whoever counts can tell when
//! every worker has synchronized.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub trait Readiness: Send + Sync {
    fn mark_ready(&self);
}

/// Shared atomic counter. Clones count into the same total.
#[derive(Debug, Clone, Default)]
pub struct ReadinessCounter(Arc<AtomicU32>);

impl ReadinessCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

impl Readiness for ReadinessCounter {
    fn mark_ready(&self) {
        let n = self.0.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(count = n, "Worker ready");
    }
}
