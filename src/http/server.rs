//! The network loop.
//!
//! # Responsibilities
//! - Own a single-threaded runtime on a dedicated OS thread
//! - Accept connections on every bound listener
//! - Serve HTTP/1.1 and HTTP/2 per connection, with upgrades
//! - Turn each request into an envelope and wait for its outcome
//! - Render outcomes: respond, abort, proxy, or complete an upgrade
//!
//! # Run Loop
//! ```text
//! while wait_for_resume():
//!     block_on(suspension_requested())   ← accept/connection tasks make progress
//!     ack_suspended()                    ← governing thread may now reconcile
//! block_on(drain connections)
//! ack_stopped()
//! ```
//!
//! # Design Decisions
//! - Connection tasks live on the runtime, not in `block_on`, so a suspension
//!   pauses them without dropping them
//! - Listeners are bound from the governing thread while the loop is
//!   suspended; their accept tasks start running on resume
//! - Handler work never runs here: the loop only awaits the lease

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::{header, request::Parts, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tower::{Service, ServiceBuilder};
use tower_http::trace::TraceLayer;

use crate::config::schema::HttpConfig;
use crate::dispatch::envelope::{ConnectionLease, DispatchQueue, HttpEnvelope, MessageEnvelope};
use crate::dispatch::outcome::DispatchOutcome;
use crate::http::proxy::{self, UpstreamClient};
use crate::http::request::{is_websocket_upgrade, HttpMethod, HttpRequest};
use crate::http::response;
use crate::http::websocket::{self, SessionRegistry};
use crate::lifecycle::control::LoopControl;
use crate::net::connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
use crate::net::listener::ListenerContext;
use crate::net::registry::ListenerBinder;
use crate::observability::metrics;
use crate::resilience::backoff::Backoff;

/// Reasons the network loop closes a connection instead of responding.
#[derive(Debug, Error)]
pub enum ConnectionAbort {
    #[error("handler requested abort")]
    Requested,

    #[error("websocket upgrade refused")]
    UpgradeRefused,

    #[error("invalid proxy target")]
    InvalidProxy,

    #[error("dispatch loop is not accepting work")]
    DispatcherGone,

    #[error("request dropped without an outcome")]
    Dropped,
}

/// Everything a connection needs, shared by all listeners of one worker.
#[derive(Clone)]
pub struct ServiceState {
    pub queue: DispatchQueue,
    pub sessions: SessionRegistry,
    pub tracker: ConnectionTracker,
    pub client: UpstreamClient,
    pub config: Arc<HttpConfig>,
}

impl ServiceState {
    pub fn new(
        config: &HttpConfig,
        queue: DispatchQueue,
        sessions: SessionRegistry,
        tracker: ConnectionTracker,
    ) -> Self {
        Self {
            queue,
            sessions,
            tracker,
            client: proxy::upstream_client(Duration::from_secs(config.upstream_connect_timeout_secs)),
            config: Arc::new(config.clone()),
        }
    }
}

/// Handle to the running network loop thread.
pub struct NetworkLoop {
    handle: Handle,
    join: JoinHandle<()>,
}

/// Marks the loop stopped however the thread exits.
struct StoppedOnExit(Arc<LoopControl>);

impl Drop for StoppedOnExit {
    fn drop(&mut self) {
        self.0.ack_stopped();
    }
}

impl NetworkLoop {
    /// Start the loop thread. It waits suspended until first resumed.
    pub fn spawn(
        control: Arc<LoopControl>,
        tracker: ConnectionTracker,
        drain_timeout: Duration,
    ) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        let join = std::thread::Builder::new()
            .name("network-loop".into())
            .spawn(move || {
                let _stopped = StoppedOnExit(Arc::clone(&control));
                while control.wait_for_resume() {
                    tracing::debug!("Network loop running");
                    runtime.block_on(control.suspension_requested());
                    control.ack_suspended();
                    tracing::debug!("Network loop suspended");
                }

                let open = tracker.active_count();
                if open > 0 {
                    tracing::info!(connections = open, "Draining connections");
                }
                if !runtime.block_on(tracker.wait_idle(drain_timeout)) {
                    tracing::warn!(
                        remaining = tracker.active_count(),
                        "Drain timeout elapsed, closing remaining connections"
                    );
                }
                drop(runtime);
                tracing::info!("Network loop stopped");
            })?;

        Ok(Self { handle, join })
    }

    pub fn binder(&self, state: ServiceState) -> NetworkBinder {
        NetworkBinder {
            handle: self.handle.clone(),
            state,
        }
    }

    /// Wait for the loop thread to exit.
    pub fn join(self) {
        if self.join.join().is_err() {
            tracing::error!("Network loop thread panicked");
        }
    }
}

/// Binds listeners into the network loop's runtime.
pub struct NetworkBinder {
    handle: Handle,
    state: ServiceState,
}

impl ListenerBinder for NetworkBinder {
    fn bind(
        &self,
        context: &Arc<ListenerContext>,
        socket: std::net::TcpListener,
    ) -> io::Result<AbortHandle> {
        let _enter = self.handle.enter();
        let listener = TcpListener::from_std(socket)?;
        let task = self.handle.spawn(accept_loop(
            listener,
            Arc::clone(context),
            self.state.clone(),
        ));
        Ok(task.abort_handle())
    }
}

async fn accept_loop(listener: TcpListener, context: Arc<ListenerContext>, state: ServiceState) {
    let mut backoff = Backoff::from_millis(5, 1_000);
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                backoff.reset();
                context.record_accept();
                let guard = state.tracker.track();
                tokio::spawn(serve_connection(
                    stream,
                    peer,
                    Arc::clone(&context),
                    state.clone(),
                    guard,
                ));
            }
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    master_fd = %context.master_fd(),
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Accept failed"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    listener: Arc<ListenerContext>,
    state: ServiceState,
    _guard: ConnectionGuard,
) {
    let _ = stream.set_nodelay(true);
    let config = Arc::clone(&state.config);

    let service = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .service(DispatchService { listener, state });
    let service = TowerToHyperService::new(service);

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(Duration::from_secs(config.idle_timeout_secs));
    builder
        .http2()
        .timer(TokioTimer::new())
        .keep_alive_interval(Some(Duration::from_secs(config.http2_keep_alive_secs)));

    if let Err(e) = builder
        .serve_connection_with_upgrades(TokioIo::new(stream), service)
        .await
    {
        tracing::trace!(peer = %peer, error = %e, "Connection closed");
    }
}

/// Per-connection service: request in, outcome rendered out.
#[derive(Clone)]
pub struct DispatchService {
    listener: Arc<ListenerContext>,
    state: ServiceState,
}

impl Service<Request<Incoming>> for DispatchService {
    type Response = Response<Body>;
    type Error = ConnectionAbort;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, ConnectionAbort>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Incoming>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            let started = Instant::now();
            let method = request.method().clone();
            let result = this.handle(request).await;
            let status = result.as_ref().map(|r| r.status().as_u16()).unwrap_or(0);
            metrics::record_request(method.as_str(), status, started);
            result
        })
    }
}

impl DispatchService {
    async fn handle(self, mut request: Request<Incoming>) -> Result<Response<Body>, ConnectionAbort> {
        let server = self.state.config.server_name.as_str();

        if HttpMethod::from_method(request.method()).is_none() {
            return Ok(response::plain(
                StatusCode::METHOD_NOT_ALLOWED,
                "Method not allowed",
                server,
            ));
        }

        let upgrade = is_websocket_upgrade(request.method(), request.headers())
            .then(|| hyper::upgrade::on(&mut request));
        let (parts, body) = request.into_parts();

        let body = if upgrade.is_some() {
            None
        } else {
            match self.read_body(&parts, body).await {
                Ok(bytes) => Some(bytes),
                Err(rejection) => return Ok(rejection),
            }
        };

        let Some(record) = HttpRequest::from_parts(&parts, body.clone()) else {
            return Ok(response::plain(
                StatusCode::METHOD_NOT_ALLOWED,
                "Method not allowed",
                server,
            ));
        };
        let connection_id = upgrade.as_ref().map(|_| ConnectionId::new());

        let (lease, pending) = ConnectionLease::new();
        let envelope = MessageEnvelope::HttpRequest(HttpEnvelope {
            listener: Arc::clone(&self.listener),
            request: record,
            websocket: connection_id,
            lease,
        });
        if self.state.queue.send(envelope).is_err() {
            tracing::warn!(path = %parts.uri.path(), "Dispatch loop gone, aborting connection");
            return Err(ConnectionAbort::DispatcherGone);
        }

        let outcome = pending.await.map_err(|_| ConnectionAbort::Dropped)?;
        self.render(outcome, parts, body.unwrap_or_default(), upgrade.zip(connection_id))
            .await
    }

    async fn read_body(&self, parts: &Parts, body: Incoming) -> Result<Bytes, Response<Body>> {
        let limit = self.state.config.max_body_size;
        let server = self.state.config.server_name.as_str();
        let too_large = || {
            response::plain(StatusCode::PAYLOAD_TOO_LARGE, "Payload too large", server)
        };

        let declared = parts
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if declared.is_some_and(|len| len > limit) {
            return Err(too_large());
        }

        axum::body::to_bytes(Body::new(body), limit).await.map_err(|e| {
            tracing::warn!(path = %parts.uri.path(), error = %e, "Failed to read request body");
            too_large()
        })
    }

    async fn render(
        &self,
        outcome: DispatchOutcome,
        parts: Parts,
        body: Bytes,
        upgrade: Option<(OnUpgrade, ConnectionId)>,
    ) -> Result<Response<Body>, ConnectionAbort> {
        let server = self.state.config.server_name.as_str();
        match outcome {
            DispatchOutcome::Response(r) => Ok(response::render(r, server)),
            DispatchOutcome::Fail(_) => Ok(response::internal_error(server)),
            DispatchOutcome::Abort => Err(ConnectionAbort::Requested),
            DispatchOutcome::Proxy(target) => match proxy::upstream_request(&target, &parts, body) {
                Ok(request) => Ok(proxy::forward(&self.state.client, request, server).await),
                Err(e) => {
                    tracing::warn!(error = %e, "Proxy target rejected, aborting connection");
                    Err(ConnectionAbort::InvalidProxy)
                }
            },
            DispatchOutcome::WebSocketUpgradeDecision(false) => Err(ConnectionAbort::UpgradeRefused),
            DispatchOutcome::WebSocketUpgradeDecision(true) => {
                let Some((on_upgrade, connection_id)) = upgrade else {
                    tracing::warn!(path = %parts.uri.path(), "Upgrade accepted for a non-upgrade request");
                    return Err(ConnectionAbort::UpgradeRefused);
                };
                let Some(accepted) = websocket::accept_key(&parts.headers)
                    .and_then(|key| websocket::switching_protocols(&key, server))
                else {
                    return Err(ConnectionAbort::UpgradeRefused);
                };
                self.start_session(on_upgrade, connection_id);
                Ok(accepted)
            }
        }
    }

    fn start_session(&self, on_upgrade: OnUpgrade, connection_id: ConnectionId) {
        let queue = self.state.queue.clone();
        let sessions = self.state.sessions.clone();
        let guard = self.state.tracker.track();
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    websocket::run_session(upgraded, connection_id, queue, sessions, guard).await
                }
                Err(e) => {
                    tracing::warn!(connection_id = %connection_id, error = %e, "WebSocket upgrade failed")
                }
            }
        });
    }
}
