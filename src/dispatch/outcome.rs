//! Handler decisions returned to the network loop.

use axum::body::Bytes;

/// A handler-built response. Missing parts take transport defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    /// `None` means 200.
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
    /// `None` means an empty body.
    pub body: Option<Bytes>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// The response used when a request handler returns nothing.
    pub fn no_content() -> Self {
        Self::new(204)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Upstream target of a `Proxy` outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub url: String,
    /// Forward the client's `Host` header instead of the upstream authority.
    pub preserve_host: bool,
}

impl ProxyTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            preserve_host: true,
        }
    }

    pub fn rewrite_host(mut self) -> Self {
        self.preserve_host = false;
        self
    }
}

/// What the network loop should do with a dispatched connection.
///
/// Consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Response(HttpResponse),
    Abort,
    Proxy(ProxyTarget),
    WebSocketUpgradeDecision(bool),
    /// The handler faulted; rendered as a generic server error.
    Fail(String),
}

impl DispatchOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchOutcome::Response(_) => "response",
            DispatchOutcome::Abort => "abort",
            DispatchOutcome::Proxy(_) => "proxy",
            DispatchOutcome::WebSocketUpgradeDecision(_) => "upgrade",
            DispatchOutcome::Fail(_) => "fail",
        }
    }
}

impl From<HttpResponse> for DispatchOutcome {
    fn from(response: HttpResponse) -> Self {
        DispatchOutcome::Response(response)
    }
}

impl From<ProxyTarget> for DispatchOutcome {
    fn from(target: ProxyTarget) -> Self {
        DispatchOutcome::Proxy(target)
    }
}
