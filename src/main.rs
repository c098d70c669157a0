//! Dispatch worker with an echo handler.
//!
//! ```text
//!   fd-coordinator ──(SCM_RIGHTS)──▶ ┌────────────────────────────────────────────┐
//!                                    │               DISPATCH WORKER               │
//!     Client Request                 │  ┌──────────────┐   queue   ┌────────────┐  │
//!     ───────────────────────────────┼─▶│ network loop │──────────▶│  dispatch  │  │
//!                                    │  │  (thread)    │           │    loop    │  │
//!     Client Response                │  │              │◀──────────│ (handler)  │  │
//!     ◀──────────────────────────────┼──│              │   lease   └────────────┘  │
//!                                    │  └──────────────┘                           │
//!                                    │   SIGHUP / config change → reload cycle     │
//!                                    └────────────────────────────────────────────┘
//! ```
//!
//! Requests are answered with a JSON description of what arrived. Every
//! WebSocket upgrade is accepted and messages are echoed back.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Bytes;
use clap::Parser;
use serde::Serialize;

use dispatch_worker::config::{load_config, ConfigWatcher, SharedCatalog};
use dispatch_worker::lifecycle::spawn_signal_thread;
use dispatch_worker::observability::{init_logging, init_metrics};
use dispatch_worker::{
    ConnectionId, DispatchOutcome, Handler, HandlerError, HttpRequest, HttpResponse, ListenerId,
    SessionRegistry, Worker,
};

#[derive(Parser)]
#[command(name = "dispatch-worker")]
#[command(about = "HTTP dispatch worker serving coordinator-owned listeners", long_about = None)]
struct Cli {
    /// Worker configuration file (TOML).
    #[arg(short, long, default_value = "worker.toml")]
    config: PathBuf,
}

#[derive(Serialize)]
struct Echo<'a> {
    listener_id: i32,
    #[serde(flatten)]
    request: &'a HttpRequest,
    body: Option<String>,
}

struct EchoHandler {
    sessions: SessionRegistry,
}

impl Handler for EchoHandler {
    fn handle_request(
        &self,
        listener: ListenerId,
        request: &HttpRequest,
    ) -> Result<Option<DispatchOutcome>, HandlerError> {
        let echo = Echo {
            listener_id: listener.get(),
            request,
            body: request
                .body
                .as_deref()
                .map(|b| String::from_utf8_lossy(b).into_owned()),
        };
        let body = serde_json::to_vec(&echo).map_err(|e| HandlerError::Other(e.into()))?;

        Ok(Some(
            HttpResponse::new(200)
                .with_header("content-type", "application/json")
                .with_body(body)
                .into(),
        ))
    }

    fn websocket_upgrade(
        &self,
        _listener: ListenerId,
        _connection: ConnectionId,
        _request: &HttpRequest,
    ) -> Result<Option<bool>, HandlerError> {
        Ok(Some(true))
    }

    fn websocket_message(
        &self,
        connection: ConnectionId,
        payload: &[u8],
        binary: bool,
    ) -> Result<(), HandlerError> {
        let sent = if binary {
            self.sessions
                .send_binary(connection, Bytes::copy_from_slice(payload))
        } else {
            self.sessions
                .send_text(connection, String::from_utf8_lossy(payload))
        };
        if !sent {
            tracing::debug!(connection_id = %connection, "Session gone before echo");
        }
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    init_logging(&config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?cli.config,
        coordinator = %config.coordinator.socket_path,
        listeners = config.listeners.len(),
        "dispatch-worker starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics exporter");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let catalog = Arc::new(SharedCatalog::from_config(&config));
    let builder = Worker::builder(config).catalog(catalog.clone());
    let handler = EchoHandler {
        sessions: builder.sessions(),
    };
    let worker = builder.handler(handler).build();
    let handle = worker.handle();

    let _signals = spawn_signal_thread(Arc::clone(handle.control()))?;
    let _watcher = match ConfigWatcher::new(&cli.config, catalog, Arc::clone(handle.control())).run() {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            tracing::warn!(error = %e, "Config watcher unavailable, reload by signal only");
            None
        }
    };

    worker.run()?;

    tracing::info!("Shutdown complete");
    Ok(())
}
