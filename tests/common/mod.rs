//! Shared utilities for integration tests: a worker harness, a scripted
//! handler, and in-process socket sources standing in for the coordinator.

#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use dispatch_worker::config::SharedCatalog;
use dispatch_worker::lifecycle::{LoopControl, ReadinessCounter};
use dispatch_worker::net::handoff::{FdSource, Handoff, HandoffError};
use dispatch_worker::net::{ListenerFd, MasterFd};
use dispatch_worker::{
    ConnectionId, DispatchOutcome, Handler, HandlerError, HttpRequest, HttpResponse, ListenerId,
    LoopPhase, ProxyTarget, SessionRegistry, Worker, WorkerConfig, WorkerError, WorkerHandle,
};

/// Sockets owned by the test, handed off as duplicates on every cycle.
///
/// Master-fds are the test's own descriptor numbers, as a coordinator would use.
#[derive(Clone, Default)]
pub struct SocketSet {
    sockets: Arc<Mutex<Vec<TcpListener>>>,
}

impl SocketSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a fresh loopback socket and add it to the set.
    pub fn bind(&self) -> SocketAddr {
        let socket = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        self.sockets.lock().unwrap().push(socket);
        addr
    }

    /// Drop the test's socket for `addr`.
    pub fn remove(&self, addr: SocketAddr) {
        self.sockets
            .lock()
            .unwrap()
            .retain(|s| s.local_addr().unwrap() != addr);
    }

    pub fn clear(&self) {
        self.sockets.lock().unwrap().clear();
    }

    fn duplicates(&self) -> Result<Vec<ListenerFd>, HandoffError> {
        let sockets = self.sockets.lock().unwrap();
        let mut fds = Vec::with_capacity(sockets.len());
        for socket in sockets.iter() {
            fds.push(ListenerFd::new(
                OwnedFd::from(socket.try_clone()?),
                MasterFd::new(socket.as_raw_fd()),
            ));
        }
        Ok(fds)
    }
}

impl FdSource for SocketSet {
    fn receive(&mut self, _control: &LoopControl) -> Result<Handoff, HandoffError> {
        Ok(Handoff::Received(self.duplicates()?))
    }
}

/// A [`SocketSet`] whose hand-offs after the first wait for the test to release them.
pub struct GatedSource {
    sockets: SocketSet,
    gate: mpsc::Receiver<()>,
    cycles: usize,
}

impl GatedSource {
    pub fn new(sockets: SocketSet) -> (Self, mpsc::Sender<()>) {
        let (tx, gate) = mpsc::channel();
        (
            Self {
                sockets,
                gate,
                cycles: 0,
            },
            tx,
        )
    }
}

impl FdSource for GatedSource {
    fn receive(&mut self, control: &LoopControl) -> Result<Handoff, HandoffError> {
        self.cycles += 1;
        if self.cycles > 1 {
            loop {
                match self.gate.recv_timeout(Duration::from_millis(10)) {
                    Ok(()) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) if control.is_running() => {}
                    Err(_) => return Ok(Handoff::Interrupted),
                }
            }
        }
        Ok(Handoff::Received(self.sockets.duplicates()?))
    }
}

/// Scripted handler keyed by request path.
///
/// - `/fail`, `/panic`: handler faults
/// - `/abort`: abort the connection
/// - `/empty`: no outcome
/// - `/short`: declares `Content-Length: 5`, sends 3 bytes
/// - `/long`: declares `Content-Length: 3`, sends 5 bytes
/// - `/proxy?to=<url>`: relay to `<url>`
/// - `/ws` accepts an upgrade, `/ws-deny` refuses it; `close` messages close the session
/// - anything else: `listener=<id> path=<path> query=<query> body=<body>`
pub struct TestHandler {
    pub sessions: SessionRegistry,
    pub events: Arc<Mutex<Vec<String>>>,
}

impl TestHandler {
    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl Handler for TestHandler {
    fn handle_request(
        &self,
        listener: ListenerId,
        request: &HttpRequest,
    ) -> Result<Option<DispatchOutcome>, HandlerError> {
        let outcome = match request.path.as_str() {
            "/fail" => return Err(HandlerError::msg("scripted failure")),
            "/panic" => panic!("scripted panic"),
            "/abort" => DispatchOutcome::Abort,
            "/empty" => return Ok(None),
            "/short" => HttpResponse::new(200)
                .with_header("Content-Length", "5")
                .with_body("abc")
                .into(),
            "/long" => HttpResponse::new(200)
                .with_header("content-length", "3")
                .with_body("hello")
                .into(),
            "/proxy" => {
                let query = request.query.as_deref().unwrap_or_default();
                let url = query.strip_prefix("to=").unwrap_or(query);
                ProxyTarget::new(url).into()
            }
            path => {
                let body = request
                    .body
                    .as_deref()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                HttpResponse::new(200)
                    .with_body(format!(
                        "listener={} path={} query={:?} body={}",
                        listener, path, request.query, body
                    ))
                    .into()
            }
        };
        Ok(Some(outcome))
    }

    fn websocket_upgrade(
        &self,
        listener: ListenerId,
        connection: ConnectionId,
        request: &HttpRequest,
    ) -> Result<Option<bool>, HandlerError> {
        self.record(format!("upgrade {listener} {connection}"));
        Ok(match request.path.as_str() {
            "/ws" => Some(true),
            "/ws-deny" => Some(false),
            _ => None,
        })
    }

    fn websocket_open(&self, connection: ConnectionId) -> Result<(), HandlerError> {
        self.record(format!("open {connection}"));
        Ok(())
    }

    fn websocket_message(
        &self,
        connection: ConnectionId,
        payload: &[u8],
        binary: bool,
    ) -> Result<(), HandlerError> {
        self.record(format!("message {connection} {}", payload.len()));
        if binary {
            self.sessions
                .send_binary(connection, Bytes::copy_from_slice(payload));
        } else if payload == b"close" {
            self.sessions.close(connection);
        } else {
            self.sessions
                .send_text(connection, String::from_utf8_lossy(payload));
        }
        Ok(())
    }

    fn websocket_close(&self, connection: ConnectionId) -> Result<(), HandlerError> {
        self.record(format!("close {connection}"));
        Ok(())
    }
}

pub fn test_config() -> WorkerConfig {
    let mut config = WorkerConfig::default();
    config.http.server_name = "dispatch-test".to_string();
    config.dispatch.reload_retry_ms = 10;
    config.lifecycle.drain_timeout_secs = 1;
    config
}

/// A worker running the [`TestHandler`] on its own thread.
pub struct TestWorker {
    pub handle: WorkerHandle,
    pub catalog: Arc<SharedCatalog>,
    pub readiness: ReadinessCounter,
    pub events: Arc<Mutex<Vec<String>>>,
    join: Option<thread::JoinHandle<Result<(), WorkerError>>>,
}

impl TestWorker {
    pub fn start(ids: &[i32], source: impl FdSource + 'static) -> Self {
        Self::start_with(test_config(), ids, source)
    }

    pub fn start_with(config: WorkerConfig, ids: &[i32], source: impl FdSource + 'static) -> Self {
        let catalog = Arc::new(SharedCatalog::new(
            ids.iter().copied().map(ListenerId::new).collect(),
        ));
        let readiness = ReadinessCounter::new();
        let events = Arc::new(Mutex::new(Vec::new()));

        let (tx, rx) = mpsc::channel();
        let join = {
            let catalog = Arc::clone(&catalog);
            let readiness = readiness.clone();
            let events = Arc::clone(&events);
            thread::spawn(move || {
                let builder = Worker::builder(config)
                    .catalog(catalog)
                    .fd_source(source)
                    .readiness(Arc::new(readiness));
                let handler = TestHandler {
                    sessions: builder.sessions(),
                    events,
                };
                let worker = builder.handler(handler).build();
                tx.send(worker.handle()).unwrap();
                worker.run()
            })
        };

        let worker = Self {
            handle: rx.recv().unwrap(),
            catalog,
            readiness,
            events,
            join: Some(join),
        };
        worker.wait_for_cycle(1);
        worker
    }

    /// Wait until `n` cycles reached readiness and the network loop runs again.
    pub fn wait_for_cycle(&self, n: u32) {
        wait_until("reload cycle", || {
            self.readiness.count() >= n && self.handle.phase() == LoopPhase::Running
        });
    }

    /// Request a reload and wait for it to complete.
    pub fn reload(&self) {
        let next = self.readiness.count() + 1;
        self.handle.reload();
        self.wait_for_cycle(next);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn stop(mut self) -> Result<(), WorkerError> {
        self.handle.shutdown();
        self.join.take().unwrap().join().unwrap()
    }
}

impl Drop for TestWorker {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            self.handle.shutdown();
            let _ = join.join();
        }
    }
}

pub fn wait_until(what: &str, f: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

/// Minimal HTTP/1.1 response read off a raw connection.
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Send a raw request head (plus body) and read one response with a
/// `Content-Length` body. The connection stays usable for keep-alive.
pub async fn raw_exchange(stream: &mut TcpStream, request: &str) -> RawResponse {
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut reader = BufReader::new(stream);
    let mut status_line = String::new();
    reader.read_line(&mut status_line).await.unwrap();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| panic!("bad status line {status_line:?}"));

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    let len = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.unwrap();

    RawResponse {
        status,
        headers,
        body,
    }
}
