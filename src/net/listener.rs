//! Listener identity and per-listener context.
//!
//! # Responsibilities
//! - Identify listeners logically (`ListenerId`) and physically (`MasterFd`)
//! - Turn a handed-off file descriptor into a non-blocking listening socket
//! - Hold the binding of a listener into the network loop so it can be released
//!
//! # Design Decisions
//! - A `ListenerContext` belongs to exactly one master-fd for its whole life
//! - The logical id is assigned after creation (second reconciliation pass),
//!   so it is stored atomically and read at dispatch time
//! - Connections keep an `Arc` to the context they were accepted on

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;

/// Logical listener id, stable across reloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenerId(i32);

impl ListenerId {
    /// Id reported for a listener the catalog has not described yet.
    pub const UNASSIGNED: ListenerId = ListenerId(0);

    pub fn new(id: i32) -> Self {
        Self(id)
    }

    pub fn get(&self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Coordinator-assigned identity of a listening socket.
///
/// Stable across reload cycles even though the worker's local descriptor
/// number differs on every hand-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MasterFd(i32);

impl MasterFd {
    pub fn new(fd: i32) -> Self {
        Self(fd)
    }

    pub fn get(&self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for MasterFd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A listening socket received from the coordinator.
#[derive(Debug)]
pub struct ListenerFd {
    pub fd: OwnedFd,
    pub master_fd: MasterFd,
}

impl ListenerFd {
    pub fn new(fd: OwnedFd, master_fd: MasterFd) -> Self {
        Self { fd, master_fd }
    }
}

/// Turn a received descriptor into a non-blocking std listener.
///
/// Interrupted syscalls are retried immediately; anything else is returned.
pub fn prepare_socket(fd: OwnedFd) -> std::io::Result<std::net::TcpListener> {
    let listener = std::net::TcpListener::from(fd);
    loop {
        match listener.set_nonblocking(true) {
            Ok(()) => break,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    // Fails for descriptors that are not bound sockets.
    listener.local_addr()?;
    Ok(listener)
}

/// Per-listener state shared between the registry and the network loop.
#[derive(Debug)]
pub struct ListenerContext {
    master_fd: MasterFd,
    local_fd: RawFd,
    local_addr: Option<SocketAddr>,
    /// 0 until assigned.
    listener_id: AtomicI32,
    accepted: AtomicU64,
    binding: Mutex<Option<AbortHandle>>,
}

impl ListenerContext {
    /// Create a context for a prepared socket. It is not bound to any loop yet.
    pub fn new(master_fd: MasterFd, socket: &std::net::TcpListener) -> Self {
        Self {
            master_fd,
            local_fd: socket.as_raw_fd(),
            local_addr: socket.local_addr().ok(),
            listener_id: AtomicI32::new(0),
            accepted: AtomicU64::new(0),
            binding: Mutex::new(None),
        }
    }

    pub fn master_fd(&self) -> MasterFd {
        self.master_fd
    }

    /// Descriptor number of the socket in this process (diagnostics only).
    pub fn local_fd(&self) -> RawFd {
        self.local_fd
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The logical id, once reconciliation assigned one.
    pub fn listener_id(&self) -> Option<ListenerId> {
        match self.listener_id.load(Ordering::Acquire) {
            id if id == ListenerId::UNASSIGNED.0 => None,
            id => Some(ListenerId(id)),
        }
    }

    pub fn set_listener_id(&self, id: ListenerId) {
        self.listener_id.store(id.0, Ordering::Release);
    }

    /// Count an accepted connection.
    pub fn record_accept(&self) -> u64 {
        self.accepted.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Total connections accepted on this listener.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Record the accept task driving this listener.
    pub fn attach(&self, handle: AbortHandle) {
        if let Ok(mut binding) = self.binding.lock() {
            *binding = Some(handle);
        }
    }

    /// Whether an accept task is attached and has not been released.
    pub fn is_bound(&self) -> bool {
        self.binding
            .lock()
            .map(|b| b.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// Stop accepting on this listener.
    ///
    /// The accept task owns the socket; it is closed once the network loop
    /// drops the aborted task. Connections already accepted are not affected.
    pub fn release(&self) {
        let handle = self.binding.lock().ok().and_then(|mut b| b.take());
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}
