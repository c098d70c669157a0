//! Development coordinator.
//!
//! Binds every `[[listeners]]` address from a worker config and hands the
//! sockets to any worker that connects to the coordinator socket. Master-fds
//! are the coordinator's own descriptor numbers. On SIGHUP the config is
//! re-read; sockets whose id and address are unchanged are kept, so workers
//! reconciling afterwards keep their connections.

use std::net::TcpListener;
use std::os::fd::{AsFd, AsRawFd};
use std::path::{Path, PathBuf};

use clap::Parser;
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};

use dispatch_worker::config::{load_config, WorkerConfig};
use dispatch_worker::net::handoff::{send_listener_fds, HandoffError};
use dispatch_worker::net::MasterFd;
use dispatch_worker::observability::init_logging;

#[derive(Parser)]
#[command(name = "fd-coordinator")]
#[command(about = "Owns listening sockets and serves them to dispatch workers", long_about = None)]
struct Cli {
    /// Worker configuration file (TOML) listing the listeners to bind.
    #[arg(short, long, default_value = "worker.toml")]
    config: PathBuf,
}

struct BoundListener {
    id: i32,
    address: String,
    socket: TcpListener,
}

/// Bind the configured listeners, reusing sockets from `previous` where possible.
///
/// Sorted by id with one socket per id, matching the catalog grouping.
fn bind_listeners(config: &WorkerConfig, previous: Vec<BoundListener>) -> Vec<BoundListener> {
    let mut entries = config.listeners.clone();
    entries.sort_by_key(|e| e.id);
    entries.dedup_by(|next, first| {
        if next.id == first.id {
            tracing::warn!(listener_id = next.id, address = %next.address, "Duplicate listener id, address ignored");
            true
        } else {
            false
        }
    });

    let mut previous = previous;
    let mut bound = Vec::with_capacity(entries.len());
    for entry in entries {
        if let Some(pos) = previous
            .iter()
            .position(|b| b.id == entry.id && b.address == entry.address)
        {
            bound.push(previous.swap_remove(pos));
            continue;
        }

        match TcpListener::bind(&entry.address) {
            Ok(socket) => {
                tracing::info!(
                    listener_id = entry.id,
                    address = ?socket.local_addr().ok(),
                    master_fd = socket.as_raw_fd(),
                    "Listener bound"
                );
                bound.push(BoundListener {
                    id: entry.id,
                    address: entry.address,
                    socket,
                });
            }
            Err(e) => {
                tracing::warn!(listener_id = entry.id, address = %entry.address, error = %e, "Failed to bind listener")
            }
        }
    }

    for stale in previous {
        tracing::info!(listener_id = stale.id, address = %stale.address, "Listener closed");
    }
    bound
}

fn serve(stream: UnixStream, listeners: &[BoundListener]) -> Result<(), HandoffError> {
    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;

    let pairs: Vec<_> = listeners
        .iter()
        .map(|b| (b.socket.as_fd(), MasterFd::new(b.socket.as_raw_fd())))
        .collect();
    send_listener_fds(&stream, &pairs)
}

fn remove_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = ?path, "Removed coordinator socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = ?path, error = %e, "Failed to remove coordinator socket"),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    init_logging(&config.observability)?;

    let mut listeners = bind_listeners(&config, Vec::new());
    let path = PathBuf::from(&config.coordinator.socket_path);
    remove_socket(&path);
    let server = UnixListener::bind(&path)?;

    tracing::info!(
        path = ?path,
        listeners = listeners.len(),
        "fd-coordinator serving"
    );

    let mut hup = signal(SignalKind::hangup())?;
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    loop {
        tokio::select! {
            accepted = server.accept() => match accepted {
                Ok((stream, _)) => match serve(stream, &listeners) {
                    Ok(()) => tracing::debug!(listeners = listeners.len(), "Listeners handed off"),
                    Err(e) => tracing::warn!(error = %e, "Hand-off failed"),
                },
                Err(e) => tracing::warn!(error = %e, "Accept failed on coordinator socket"),
            },
            _ = hup.recv() => match load_config(&cli.config) {
                Ok(config) => {
                    listeners = bind_listeners(&config, listeners);
                    tracing::info!(listeners = listeners.len(), "Configuration reloaded");
                }
                Err(e) => tracing::warn!(error = %e, "Failed to reload config, keeping current listeners"),
            },
            _ = term.recv() => break,
            _ = int.recv() => break,
        }
    }

    remove_socket(&path);
    tracing::info!("fd-coordinator stopped");
    Ok(())
}
