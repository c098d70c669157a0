//! Listener registry and reconciliation.
//!
//! # Responsibilities
//! - Track the active set of listeners (socket, logical id, loop binding)
//! - Diff the active set against a freshly handed-off fd set by master-fd
//! - Assign logical ids from the catalog snapshot
//!
//! # Algorithm
//! ```text
//! for each active entry:
//!     master-fd in new set?  yes → keep entry, close the duplicate fd
//!                            no  → release entry (stale)
//! for each remaining new fd:
//!     prepare socket → create context → bind into network loop
//!     (failures are logged and skipped, the rest proceed)
//! then:
//!     group catalog ids (consecutive equal ids = one socket)
//!     → pair group i with fd i → set id on the context with that master-fd
//! ```
//!
//! # Design Decisions
//! - Kept entries are the same `Arc`: their connections are never disturbed
//! - The registry is only mutated while the network loop is suspended

use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::AbortHandle;

use crate::net::listener::{prepare_socket, ListenerContext, ListenerFd, ListenerId, MasterFd};
use crate::observability::metrics;

/// Binds a prepared listening socket into an event loop.
pub trait ListenerBinder {
    /// Start accepting on `socket` on behalf of `context`.
    ///
    /// Returns the handle used to stop accepting later.
    fn bind(
        &self,
        context: &Arc<ListenerContext>,
        socket: std::net::TcpListener,
    ) -> io::Result<AbortHandle>;
}

/// What a reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Entries whose master-fd persisted.
    pub kept: Vec<MasterFd>,
    /// New entries created and bound.
    pub created: Vec<MasterFd>,
    /// Stale entries released.
    pub destroyed: Vec<MasterFd>,
    /// New fds that could not be set up.
    pub failed: Vec<MasterFd>,
}

impl ReconcileReport {
    /// True if the pass neither created nor destroyed anything.
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.destroyed.is_empty() && self.failed.is_empty()
    }
}

/// Error type for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("catalog describes {groups} listeners but {fds} sockets were handed off")]
    CountMismatch { groups: usize, fds: usize },
}

/// Catalog rows paired index-wise with the fds of one hand-off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationSnapshot {
    ids: Vec<ListenerId>,
    master_fds: Vec<MasterFd>,
}

impl ReconciliationSnapshot {
    pub fn new(ids: Vec<ListenerId>, master_fds: Vec<MasterFd>) -> Self {
        Self { ids, master_fds }
    }

    /// Pair each group of consecutive equal ids with the master-fd at the same index.
    pub fn assignments(&self) -> Result<Vec<(ListenerId, MasterFd)>, ReconcileError> {
        let mut groups: Vec<ListenerId> = Vec::with_capacity(self.ids.len());
        for id in &self.ids {
            if groups.last() != Some(id) {
                groups.push(*id);
            }
        }

        if groups.len() != self.master_fds.len() {
            return Err(ReconcileError::CountMismatch {
                groups: groups.len(),
                fds: self.master_fds.len(),
            });
        }

        Ok(groups.into_iter().zip(self.master_fds.iter().copied()).collect())
    }
}

/// The active set of listeners of one worker.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    entries: Vec<Arc<ListenerContext>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Arc<ListenerContext>] {
        &self.entries
    }

    /// Find the entry for a master-fd.
    pub fn get(&self, master_fd: MasterFd) -> Option<&Arc<ListenerContext>> {
        self.entries.iter().find(|e| e.master_fd() == master_fd)
    }

    /// Apply the minimal create/destroy delta for a new fd set.
    pub fn reconcile<B: ListenerBinder + ?Sized>(
        &mut self,
        incoming: Vec<ListenerFd>,
        binder: &B,
    ) -> ReconcileReport {
        let mut incoming = incoming;
        let mut report = ReconcileReport::default();
        let mut active = Vec::with_capacity(self.entries.len() + incoming.len());

        for entry in self.entries.drain(..) {
            match incoming.iter().position(|f| f.master_fd == entry.master_fd()) {
                Some(pos) => {
                    // Closes the duplicate descriptor; the entry keeps its own socket.
                    drop(incoming.remove(pos));
                    report.kept.push(entry.master_fd());
                    active.push(entry);
                }
                None => {
                    tracing::info!(
                        master_fd = %entry.master_fd(),
                        listener_id = ?entry.listener_id(),
                        accepted = entry.accepted(),
                        "Releasing stale listener"
                    );
                    entry.release();
                    report.destroyed.push(entry.master_fd());
                }
            }
        }

        for ListenerFd { fd, master_fd } in incoming {
            match create_listener(fd, master_fd, binder) {
                Ok(context) => {
                    tracing::info!(
                        master_fd = %master_fd,
                        local_addr = ?context.local_addr(),
                        "Listener created"
                    );
                    report.created.push(master_fd);
                    active.push(context);
                }
                Err(e) => {
                    tracing::warn!(master_fd = %master_fd, error = %e, "Socket error, listener skipped");
                    metrics::record_listener_setup_failure();
                    report.failed.push(master_fd);
                }
            }
        }

        self.entries = active;
        metrics::record_reconcile(&report, self.entries.len());
        report
    }

    /// Set logical ids from snapshot assignments. Returns how many were applied.
    pub fn assign_ids(&self, assignments: &[(ListenerId, MasterFd)]) -> usize {
        let mut applied = 0;
        for (id, master_fd) in assignments {
            match self.get(*master_fd) {
                Some(context) => {
                    context.set_listener_id(*id);
                    applied += 1;
                }
                None => tracing::warn!(
                    listener_id = %id,
                    master_fd = %master_fd,
                    "No active listener for configured id"
                ),
            }
        }
        applied
    }

    /// Release every listener. Used on shutdown.
    pub fn dispose_all(&mut self) -> Vec<MasterFd> {
        let released: Vec<MasterFd> = self
            .entries
            .drain(..)
            .map(|entry| {
                entry.release();
                entry.master_fd()
            })
            .collect();
        metrics::record_reconcile(
            &ReconcileReport {
                destroyed: released.clone(),
                ..Default::default()
            },
            0,
        );
        released
    }
}

fn create_listener<B: ListenerBinder + ?Sized>(
    fd: std::os::fd::OwnedFd,
    master_fd: MasterFd,
    binder: &B,
) -> io::Result<Arc<ListenerContext>> {
    let socket = prepare_socket(fd)?;
    let context = Arc::new(ListenerContext::new(master_fd, &socket));
    let handle = binder.bind(&context, socket)?;
    context.attach(handle);
    Ok(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::OwnedFd;
    use std::sync::Mutex;

    /// Binds by parking the socket in a never-ending task on a private runtime.
    struct ParkingBinder {
        runtime: tokio::runtime::Runtime,
        bound: Mutex<Vec<MasterFd>>,
    }

    impl ParkingBinder {
        fn new() -> Self {
            Self {
                runtime: tokio::runtime::Builder::new_current_thread().build().unwrap(),
                bound: Mutex::new(Vec::new()),
            }
        }

        fn bound(&self) -> Vec<MasterFd> {
            self.bound.lock().unwrap().clone()
        }
    }

    impl ListenerBinder for ParkingBinder {
        fn bind(
            &self,
            context: &Arc<ListenerContext>,
            socket: std::net::TcpListener,
        ) -> io::Result<AbortHandle> {
            self.bound.lock().unwrap().push(context.master_fd());
            let task = self.runtime.spawn(async move {
                let _socket = socket;
                std::future::pending::<()>().await
            });
            Ok(task.abort_handle())
        }
    }

    struct FailingBinder;

    impl ListenerBinder for FailingBinder {
        fn bind(&self, _: &Arc<ListenerContext>, _: std::net::TcpListener) -> io::Result<AbortHandle> {
            Err(io::Error::new(io::ErrorKind::AddrInUse, "bind failed"))
        }
    }

    fn socket_fd() -> OwnedFd {
        OwnedFd::from(std::net::TcpListener::bind("127.0.0.1:0").unwrap())
    }

    fn fd(master: i32) -> ListenerFd {
        ListenerFd::new(socket_fd(), MasterFd::new(master))
    }

    fn masters(registry: &ListenerRegistry) -> Vec<MasterFd> {
        let mut m: Vec<_> = registry.entries().iter().map(|e| e.master_fd()).collect();
        m.sort();
        m
    }

    #[test]
    fn creates_exactly_new_and_destroys_exactly_stale() {
        let binder = ParkingBinder::new();
        let mut registry = ListenerRegistry::new();
        registry.reconcile(vec![fd(100), fd(200)], &binder);
        let kept = Arc::clone(registry.get(MasterFd::new(100)).unwrap());
        let stale = Arc::clone(registry.get(MasterFd::new(200)).unwrap());

        let report = registry.reconcile(vec![fd(100), fd(300)], &binder);

        assert_eq!(report.kept, vec![MasterFd::new(100)]);
        assert_eq!(report.created, vec![MasterFd::new(300)]);
        assert_eq!(report.destroyed, vec![MasterFd::new(200)]);
        assert!(report.failed.is_empty());
        assert_eq!(masters(&registry), vec![MasterFd::new(100), MasterFd::new(300)]);

        let still = registry.get(MasterFd::new(100)).unwrap();
        assert!(Arc::ptr_eq(&kept, still));
        assert_eq!(kept.local_fd(), still.local_fd());
        assert!(!stale.is_bound());
    }

    #[test]
    fn reconcile_is_idempotent() {
        let binder = ParkingBinder::new();
        let mut registry = ListenerRegistry::new();
        registry.reconcile(vec![fd(1), fd(2)], &binder);
        let before: Vec<_> = registry.entries().to_vec();

        let report = registry.reconcile(vec![fd(1), fd(2)], &binder);

        assert!(report.is_noop());
        assert_eq!(binder.bound().len(), 2);
        for (a, b) in before.iter().zip(registry.entries()) {
            assert!(Arc::ptr_eq(a, b));
        }
    }

    #[test]
    fn setup_failure_skips_only_that_listener() {
        let mut registry = ListenerRegistry::new();
        let not_a_socket = ListenerFd::new(
            OwnedFd::from(tempfile::tempfile().unwrap()),
            MasterFd::new(1),
        );

        let binder = ParkingBinder::new();
        let report = registry.reconcile(vec![not_a_socket, fd(2)], &binder);

        assert_eq!(report.failed, vec![MasterFd::new(1)]);
        assert_eq!(report.created, vec![MasterFd::new(2)]);
        assert_eq!(masters(&registry), vec![MasterFd::new(2)]);

        let report = registry.reconcile(vec![fd(2), fd(3)], &FailingBinder);
        assert_eq!(report.failed, vec![MasterFd::new(3)]);
        assert_eq!(masters(&registry), vec![MasterFd::new(2)]);
    }

    #[test]
    fn snapshot_groups_consecutive_ids() {
        let snapshot = ReconciliationSnapshot::new(
            vec![ListenerId::new(1), ListenerId::new(1), ListenerId::new(2)],
            vec![MasterFd::new(100), MasterFd::new(200)],
        );
        assert_eq!(
            snapshot.assignments().unwrap(),
            vec![
                (ListenerId::new(1), MasterFd::new(100)),
                (ListenerId::new(2), MasterFd::new(200)),
            ]
        );
    }

    #[test]
    fn snapshot_count_mismatch_is_an_error() {
        let snapshot = ReconciliationSnapshot::new(
            vec![ListenerId::new(1), ListenerId::new(2)],
            vec![MasterFd::new(100)],
        );
        assert_eq!(
            snapshot.assignments().unwrap_err(),
            ReconcileError::CountMismatch { groups: 2, fds: 1 }
        );
    }

    #[test]
    fn keeps_existing_and_assigns_new_id() {
        let binder = ParkingBinder::new();
        let mut registry = ListenerRegistry::new();
        registry.reconcile(vec![fd(100)], &binder);
        registry.assign_ids(&[(ListenerId::new(1), MasterFd::new(100))]);
        let original = Arc::clone(registry.get(MasterFd::new(100)).unwrap());

        let incoming = vec![fd(100), fd(200)];
        let snapshot = ReconciliationSnapshot::new(
            vec![ListenerId::new(1), ListenerId::new(2)],
            incoming.iter().map(|f| f.master_fd).collect(),
        );
        let report = registry.reconcile(incoming, &binder);
        let applied = registry.assign_ids(&snapshot.assignments().unwrap());

        assert_eq!(report.created, vec![MasterFd::new(200)]);
        assert_eq!(applied, 2);
        let first = registry.get(MasterFd::new(100)).unwrap();
        assert!(Arc::ptr_eq(first, &original));
        assert_eq!(first.listener_id(), Some(ListenerId::new(1)));
        assert_eq!(
            registry.get(MasterFd::new(200)).unwrap().listener_id(),
            Some(ListenerId::new(2))
        );
    }

    #[test]
    fn dispose_all_releases_everything() {
        let binder = ParkingBinder::new();
        let mut registry = ListenerRegistry::new();
        registry.reconcile(vec![fd(1), fd(2)], &binder);
        let contexts: Vec<_> = registry.entries().to_vec();

        let released = registry.dispose_all();

        assert_eq!(released.len(), 2);
        assert!(registry.is_empty());
        assert!(contexts.iter().all(|c| !c.is_bound()));
    }
}
