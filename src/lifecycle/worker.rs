//! Worker assembly and the governing thread.
//!
//! # Responsibilities
//! - Build the shared context both loops hold handles to
//! - Start the network loop thread
//! - Run the dispatch loop on the calling thread
//! - Run reload cycles between dispatch batches
//! - Dispose everything on shutdown
//!
//! # Reload Cycle
//! ```text
//! take reload flag
//!   → catalog query        (Locked: defer, retry after dispatch.reload_retry_ms)
//!   → mark ready
//!   → fd hand-off          (Interrupted: skip)
//!   → validate snapshot    (mismatch: abandon, nothing touched)
//!   → wait suspended → reconcile → assign ids → resume
//! ```
//!
//! # Design Decisions
//! - The governing thread is the dispatch thread: reconciliation never races
//!   with handler execution
//! - Every exit from a cycle leaves the network loop running
//! - Only startup-level failures end `run` with an error

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::config::catalog::{ListenerCatalog, SharedCatalog};
use crate::config::schema::WorkerConfig;
use crate::dispatch::dispatcher::{Dispatcher, PumpExit};
use crate::dispatch::envelope::{dispatch_queue, Dequeued, DispatchQueue, DispatchReceiver};
use crate::dispatch::handler::Handler;
use crate::http::server::{NetworkBinder, NetworkLoop, ServiceState};
use crate::http::websocket::SessionRegistry;
use crate::lifecycle::control::{LoopControl, LoopPhase};
use crate::lifecycle::readiness::{Readiness, ReadinessCounter};
use crate::net::connection::ConnectionTracker;
use crate::net::handoff::{CoordinatorClient, FdSource, Handoff, HandoffError};
use crate::net::listener::MasterFd;
use crate::net::registry::{ListenerRegistry, ReconciliationSnapshot};
use crate::observability::metrics;

/// Errors that end [`Worker::run`].
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to create dispatch runtime: {0}")]
    Runtime(#[source] io::Error),

    #[error("failed to start network loop: {0}")]
    Spawn(#[source] io::Error),

    #[error("listener hand-off failed: {0}")]
    Handoff(#[from] HandoffError),

    #[error("network loop stopped unexpectedly")]
    NetworkLoopStopped,
}

/// State shared by both loops. Every field is a cheap handle.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub config: Arc<WorkerConfig>,
    pub control: Arc<LoopControl>,
    pub queue: DispatchQueue,
    pub sessions: SessionRegistry,
    pub tracker: ConnectionTracker,
}

/// Remote control for a worker, usable from any thread.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    context: WorkerContext,
}

impl WorkerHandle {
    /// Request a reload cycle.
    pub fn reload(&self) {
        self.context.control.request_reload();
    }

    /// Request shutdown. `run` returns once connections drained.
    pub fn shutdown(&self) {
        self.context.control.request_shutdown();
    }

    pub fn phase(&self) -> LoopPhase {
        self.context.control.phase()
    }

    /// Push frames to, or close, live WebSocket sessions.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.context.sessions
    }

    pub fn control(&self) -> &Arc<LoopControl> {
        &self.context.control
    }

    pub fn active_connections(&self) -> usize {
        self.context.tracker.active_count()
    }
}

/// Builder for [`Worker`]. The handler is set last since it may not be `Send`.
pub struct WorkerBuilder<H> {
    config: WorkerConfig,
    handler: H,
    sessions: SessionRegistry,
    catalog: Option<Arc<dyn ListenerCatalog>>,
    fd_source: Option<Box<dyn FdSource>>,
    readiness: Option<Arc<dyn Readiness>>,
}

impl<H> WorkerBuilder<H> {
    /// The worker's session registry, for handlers that push WebSocket frames.
    pub fn sessions(&self) -> SessionRegistry {
        self.sessions.clone()
    }

    /// Where listener ids come from. Defaults to the config's `[[listeners]]`.
    pub fn catalog(mut self, catalog: Arc<dyn ListenerCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Where listening sockets come from. Defaults to the coordinator socket.
    pub fn fd_source(mut self, source: impl FdSource + 'static) -> Self {
        self.fd_source = Some(Box::new(source));
        self
    }

    pub fn readiness(mut self, readiness: Arc<dyn Readiness>) -> Self {
        self.readiness = Some(readiness);
        self
    }

    pub fn handler<T: Handler>(self, handler: T) -> WorkerBuilder<T> {
        WorkerBuilder {
            config: self.config,
            handler,
            sessions: self.sessions,
            catalog: self.catalog,
            fd_source: self.fd_source,
            readiness: self.readiness,
        }
    }
}

impl<H: Handler> WorkerBuilder<H> {
    pub fn build(self) -> Worker<H> {
        let (queue, receiver) = dispatch_queue();
        let control = Arc::new(LoopControl::new(queue.clone()));
        let sessions = self.sessions;

        let catalog = self
            .catalog
            .unwrap_or_else(|| Arc::new(SharedCatalog::from_config(&self.config)));
        let fd_source = self
            .fd_source
            .unwrap_or_else(|| Box::new(CoordinatorClient::new(&self.config.coordinator)));
        let readiness = self
            .readiness
            .unwrap_or_else(|| Arc::new(ReadinessCounter::new()));

        Worker {
            context: WorkerContext {
                config: Arc::new(self.config),
                control,
                queue,
                sessions: sessions.clone(),
                tracker: ConnectionTracker::new(),
            },
            dispatcher: Dispatcher::new(self.handler, sessions),
            receiver,
            catalog,
            fd_source,
            readiness,
        }
    }
}

/// One worker: a network loop thread plus the dispatch loop on the caller.
pub struct Worker<H> {
    context: WorkerContext,
    dispatcher: Dispatcher<H>,
    receiver: DispatchReceiver,
    catalog: Arc<dyn ListenerCatalog>,
    fd_source: Box<dyn FdSource>,
    readiness: Arc<dyn Readiness>,
}

impl Worker<()> {
    pub fn builder(config: WorkerConfig) -> WorkerBuilder<()> {
        WorkerBuilder {
            config,
            handler: (),
            sessions: SessionRegistry::new(),
            catalog: None,
            fd_source: None,
            readiness: None,
        }
    }
}

impl<H: Handler> Worker<H> {
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            context: self.context.clone(),
        }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.context
    }

    /// Run until shutdown. Blocks the calling thread.
    pub fn run(self) -> Result<(), WorkerError> {
        let Worker {
            context,
            dispatcher,
            mut receiver,
            catalog,
            mut fd_source,
            readiness,
        } = self;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(WorkerError::Runtime)?;

        let drain_timeout = Duration::from_secs(context.config.lifecycle.drain_timeout_secs);
        let network = NetworkLoop::spawn(
            Arc::clone(&context.control),
            context.tracker.clone(),
            drain_timeout,
        )
        .map_err(WorkerError::Spawn)?;

        let binder = network.binder(ServiceState::new(
            &context.config.http,
            context.queue.clone(),
            context.sessions.clone(),
            context.tracker.clone(),
        ));

        let mut cycle = ReloadCycle {
            context: &context,
            catalog: catalog.as_ref(),
            fd_source: fd_source.as_mut(),
            readiness: readiness.as_ref(),
            binder: &binder,
            registry: ListenerRegistry::new(),
        };

        tracing::info!("Worker started");

        let mut retry_at = None;
        let result = loop {
            let exit = runtime.block_on(dispatcher.pump(
                &mut receiver,
                &context.control,
                retry_at.take(),
            ));
            match exit {
                PumpExit::Reload => match cycle.run() {
                    Ok(next) => retry_at = next,
                    Err(e) => break Err(e),
                },
                PumpExit::Shutdown => break Ok(()),
                PumpExit::Closed => {
                    tracing::warn!("Dispatch queue closed unexpectedly");
                    break Ok(());
                }
            }
        };

        tracing::info!("Worker shutting down");
        context.control.request_shutdown();
        context.control.wait_suspended();

        let released = cycle.registry.dispose_all();
        let closed = context.sessions.close_all();

        receiver.close();
        let mut dropped = 0usize;
        while let Some(item) = receiver.try_recv() {
            if let Dequeued::Message(_) = item {
                dropped += 1;
            }
        }
        tracing::info!(
            listeners = released.len(),
            sessions = closed,
            dropped_messages = dropped,
            "Listeners released"
        );

        context.control.drain();
        network.join();
        drop(runtime);

        tracing::info!("Worker stopped");
        result
    }
}

struct ReloadCycle<'a> {
    context: &'a WorkerContext,
    catalog: &'a dyn ListenerCatalog,
    fd_source: &'a mut dyn FdSource,
    readiness: &'a dyn Readiness,
    binder: &'a NetworkBinder,
    registry: ListenerRegistry,
}

impl ReloadCycle<'_> {
    /// Run one cycle. Returns when a deferred cycle should be retried.
    fn run(&mut self) -> Result<Option<Instant>, WorkerError> {
        let control = Arc::clone(&self.context.control);
        control.take_reload();

        let ids = match self.catalog.listener_ids() {
            Ok(ids) => ids,
            Err(e) if e.is_retryable() => {
                let delay = Duration::from_millis(self.context.config.dispatch.reload_retry_ms);
                tracing::info!(retry_ms = delay.as_millis() as u64, "Listener catalog locked, deferring reload");
                metrics::record_reload_cycle("deferred");
                self.keep_serving()?;
                return Ok(Some(Instant::now() + delay));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read listener catalog, skipping reload");
                metrics::record_reload_cycle("skipped");
                self.keep_serving()?;
                return Ok(None);
            }
        };

        self.readiness.mark_ready();

        let fds = match self.fd_source.receive(&control) {
            Ok(Handoff::Received(fds)) => fds,
            Ok(Handoff::Interrupted) => {
                tracing::debug!("Listener hand-off interrupted");
                metrics::record_reload_cycle("interrupted");
                self.keep_serving()?;
                return Ok(None);
            }
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                tracing::warn!(error = %e, "Listener hand-off failed, skipping reload");
                metrics::record_reload_cycle("skipped");
                self.keep_serving()?;
                return Ok(None);
            }
        };

        if !control.is_running() {
            return Ok(None);
        }

        // The coordinator answers with nothing when a reload overtook the hand-off.
        if fds.is_empty() {
            tracing::debug!("Empty listener hand-off, keeping current listeners");
            metrics::record_reload_cycle("interrupted");
            self.keep_serving()?;
            return Ok(None);
        }

        let master_fds: Vec<MasterFd> = fds.iter().map(|f| f.master_fd).collect();
        let assignments = match ReconciliationSnapshot::new(ids, master_fds).assignments() {
            Ok(assignments) => assignments,
            Err(e) => {
                tracing::warn!(error = %e, "Reconciliation abandoned");
                metrics::record_reload_cycle("abandoned");
                self.keep_serving()?;
                return Ok(None);
            }
        };

        if control.wait_suspended() == LoopPhase::Stopped || !control.begin_reconcile() {
            return Err(WorkerError::NetworkLoopStopped);
        }

        let report = self.registry.reconcile(fds, self.binder);
        let assigned = self.registry.assign_ids(&assignments);
        tracing::info!(
            kept = report.kept.len(),
            created = report.created.len(),
            destroyed = report.destroyed.len(),
            failed = report.failed.len(),
            assigned,
            "Listeners reconciled"
        );

        if control.resume() == LoopPhase::Stopped {
            return Err(WorkerError::NetworkLoopStopped);
        }
        metrics::record_reload_cycle("completed");
        Ok(None)
    }

    /// Make sure the network loop is running after a cycle that touched nothing.
    fn keep_serving(&self) -> Result<(), WorkerError> {
        let control = &self.context.control;
        if control.phase() == LoopPhase::Running {
            return Ok(());
        }
        if control.wait_suspended() == LoopPhase::Stopped {
            return Err(WorkerError::NetworkLoopStopped);
        }
        control.resume();
        Ok(())
    }
}
