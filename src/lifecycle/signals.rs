//! OS signal handling.
//!
//! # Responsibilities
//! - SIGHUP → request a reload cycle
//! - SIGTERM / SIGINT → request shutdown
//!
//! # Design Decisions
//! - Signals are received on a dedicated thread with its own runtime; the
//!   thread only flips flags on `LoopControl` and never touches loop state
//! - Handlers are registered before the thread starts so registration
//!   errors surface to the caller

use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;

use crate::lifecycle::control::LoopControl;

/// Running signal thread. Dropping it stops the thread.
#[derive(Debug)]
pub struct SignalThread {
    stop: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

/// Install signal handlers and start translating signals for `control`.
pub fn spawn_signal_thread(control: Arc<LoopControl>) -> io::Result<SignalThread> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()?;

    let (mut hup, mut term, mut int) = runtime.block_on(async {
        Ok::<_, io::Error>((
            signal(SignalKind::hangup())?,
            signal(SignalKind::terminate())?,
            signal(SignalKind::interrupt())?,
        ))
    })?;

    let (stop_tx, mut stop_rx) = oneshot::channel();
    let join = std::thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            runtime.block_on(async move {
                loop {
                    tokio::select! {
                        _ = hup.recv() => {
                            tracing::info!("SIGHUP received, requesting reload");
                            control.request_reload();
                        }
                        _ = term.recv() => {
                            tracing::info!("SIGTERM received, shutting down");
                            control.request_shutdown();
                            break;
                        }
                        _ = int.recv() => {
                            tracing::info!("SIGINT received, shutting down");
                            control.request_shutdown();
                            break;
                        }
                        _ = &mut stop_rx => break,
                    }
                }
            })
        })?;

    Ok(SignalThread {
        stop: Some(stop_tx),
        join: Some(join),
    })
}

impl Drop for SignalThread {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
