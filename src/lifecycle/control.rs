//! Reload/quiesce handshake between the governing thread and the network loop.
//!
//! # State Machine
//! ```text
//!            request_reload / wait_suspended        ack_suspended
//! Running ───────────────────────────────▶ ReconcilePending ──────▶ Suspended
//!    ▲                                                                │  │
//!    │ wait_for_resume                         begin_reconcile        │  │ drain
//! Resuming ◀──────────── resume ◀──────────── Reconciling ◀──────────┘  ▼
//!                                                                   Draining ──▶ Stopped
//! ```
//!
//! # Design Decisions
//! - Flags are atomics; the phase lives behind one mutex + condvar pair
//! - The network wake is a `Notify` permit: a request that lands between the
//!   loop's flag check and its wait is never lost
//! - The network loop decides to suspend from the phase, not the reload flag,
//!   so the governing thread may consume the flag at any time
//! - Lock poisoning is ignored: the guarded data is a plain enum

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use crate::dispatch::envelope::DispatchQueue;

/// Phase of the network loop as seen by the governing thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Running,
    ReconcilePending,
    Suspended,
    Reconciling,
    Resuming,
    Draining,
    Stopped,
}

/// Shared flags and the suspend/resume handshake.
#[derive(Debug)]
pub struct LoopControl {
    running: AtomicBool,
    reload: AtomicBool,
    phase: Mutex<LoopPhase>,
    changed: Condvar,
    network_wake: Notify,
    dispatch: DispatchQueue,
}

impl LoopControl {
    /// Starts suspended with a reload pending, so the first cycle binds listeners.
    pub fn new(dispatch: DispatchQueue) -> Self {
        Self {
            running: AtomicBool::new(true),
            reload: AtomicBool::new(true),
            phase: Mutex::new(LoopPhase::Suspended),
            changed: Condvar::new(),
            network_wake: Notify::new(),
            dispatch,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn reload_requested(&self) -> bool {
        self.reload.load(Ordering::Acquire)
    }

    /// Clear the reload flag, returning whether it was set.
    pub fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::AcqRel)
    }

    /// A hand-off in progress should give up.
    pub fn handoff_interrupted(&self) -> bool {
        !self.is_running() || self.reload_requested()
    }

    pub fn phase(&self) -> LoopPhase {
        *self.lock()
    }

    /// Ask for a reconciliation cycle. Ignored once shutdown started.
    pub fn request_reload(&self) {
        if !self.is_running() {
            return;
        }
        self.reload.store(true, Ordering::Release);
        {
            let mut phase = self.lock();
            if *phase == LoopPhase::Running {
                *phase = LoopPhase::ReconcilePending;
                self.changed.notify_all();
            }
        }
        self.wake();
    }

    /// Ask both loops to stop.
    pub fn request_shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.changed.notify_all();
        self.wake();
    }

    fn wake(&self) {
        self.network_wake.notify_one();
        self.dispatch.wake();
    }

    fn lock(&self) -> MutexGuard<'_, LoopPhase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, LoopPhase>) -> MutexGuard<'a, LoopPhase> {
        self.changed.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, next: LoopPhase) {
        let mut phase = self.lock();
        tracing::debug!(from = ?*phase, to = ?next, "Loop phase change");
        *phase = next;
        self.changed.notify_all();
    }

    // Network loop side.

    /// Block until the governing thread resumes the loop.
    ///
    /// Returns false when the loop should drain and exit instead.
    pub fn wait_for_resume(&self) -> bool {
        let mut phase = self.lock();
        loop {
            match *phase {
                LoopPhase::Resuming => {
                    *phase = LoopPhase::Running;
                    self.changed.notify_all();
                    return true;
                }
                LoopPhase::Running | LoopPhase::ReconcilePending => return true,
                LoopPhase::Draining | LoopPhase::Stopped => return false,
                LoopPhase::Suspended | LoopPhase::Reconciling => phase = self.wait(phase),
            }
        }
    }

    /// Resolves when the network loop should leave its run call.
    pub async fn suspension_requested(&self) {
        loop {
            let notified = self.network_wake.notified();
            if !self.is_running()
                || matches!(
                    self.phase(),
                    LoopPhase::ReconcilePending | LoopPhase::Draining
                )
            {
                return;
            }
            notified.await;
        }
    }

    /// The network loop finished its iteration and holds no socket activity.
    pub fn ack_suspended(&self) {
        let mut phase = self.lock();
        if matches!(*phase, LoopPhase::Running | LoopPhase::ReconcilePending) {
            *phase = LoopPhase::Suspended;
            self.changed.notify_all();
        }
    }

    /// The network loop has exited.
    pub fn ack_stopped(&self) {
        self.set(LoopPhase::Stopped);
    }

    // Governing thread side.

    /// Suspend the network loop and wait until it acknowledges.
    ///
    /// Returns the phase reached: `Suspended`, or `Stopped` if the loop is gone.
    pub fn wait_suspended(&self) -> LoopPhase {
        let mut phase = self.lock();
        if *phase == LoopPhase::Running {
            *phase = LoopPhase::ReconcilePending;
            self.changed.notify_all();
        }
        self.network_wake.notify_one();
        while !matches!(*phase, LoopPhase::Suspended | LoopPhase::Stopped) {
            phase = self.wait(phase);
        }
        *phase
    }

    /// Enter reconciliation. Only valid while suspended.
    pub fn begin_reconcile(&self) -> bool {
        let mut phase = self.lock();
        if *phase != LoopPhase::Suspended {
            return false;
        }
        *phase = LoopPhase::Reconciling;
        self.changed.notify_all();
        true
    }

    /// Let the network loop run again and wait for it to acknowledge.
    pub fn resume(&self) -> LoopPhase {
        let mut phase = self.lock();
        if !matches!(*phase, LoopPhase::Suspended | LoopPhase::Reconciling) {
            return *phase;
        }
        *phase = LoopPhase::Resuming;
        self.changed.notify_all();
        while *phase == LoopPhase::Resuming {
            phase = self.wait(phase);
        }
        *phase
    }

    /// Tell a suspended network loop to drain and exit.
    pub fn drain(&self) {
        let mut phase = self.lock();
        if *phase != LoopPhase::Stopped {
            *phase = LoopPhase::Draining;
            self.changed.notify_all();
        }
        drop(phase);
        self.network_wake.notify_one();
    }

    /// Wait for the network loop to exit. Returns false on timeout.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        let phase = self.lock();
        let (phase, _) = self
            .changed
            .wait_timeout_while(phase, timeout, |p| *p != LoopPhase::Stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *phase == LoopPhase::Stopped
    }
}
