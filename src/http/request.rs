//! Request record construction.
//!
//! # Responsibilities
//! - Map the wire method onto the supported set
//! - Normalize the path (dot segments, duplicate slashes)
//! - Keep query absent vs. present-but-empty distinct
//! - Copy headers in wire order
//!
//! # Design Decisions
//! - The record is owned and `Send`: it crosses to the dispatch thread
//! - Body is read fully before the record is built
//! - Non-UTF-8 header values are carried lossily rather than rejected

use axum::body::Bytes;
use axum::http::{header, request::Parts, HeaderMap, Method};
use serde::Serialize;

/// Methods the dispatcher accepts. Anything else is answered 405.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl HttpMethod {
    pub fn from_method(method: &Method) -> Option<Self> {
        let m = match *method {
            Method::GET => HttpMethod::Get,
            Method::HEAD => HttpMethod::Head,
            Method::POST => HttpMethod::Post,
            Method::PUT => HttpMethod::Put,
            Method::DELETE => HttpMethod::Delete,
            Method::CONNECT => HttpMethod::Connect,
            Method::OPTIONS => HttpMethod::Options,
            Method::TRACE => HttpMethod::Trace,
            Method::PATCH => HttpMethod::Patch,
            _ => return None,
        };
        Some(m)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Connect => "CONNECT",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Trace => "TRACE",
            HttpMethod::Patch => "PATCH",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One HTTP request as seen by a handler.
#[derive(Debug, Clone, Serialize)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub path: String,
    /// `None` when the target had no `?`, `Some("")` for a bare `?`.
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
    /// Absent for WebSocket upgrade requests.
    #[serde(skip)]
    pub body: Option<Bytes>,
}

impl HttpRequest {
    /// Build a record from request head parts. Returns `None` for unsupported methods.
    pub fn from_parts(parts: &Parts, body: Option<Bytes>) -> Option<Self> {
        let method = HttpMethod::from_method(&parts.method)?;
        Some(Self {
            method,
            path: normalize_path(parts.uri.path()),
            query: parts.uri.query().map(str::to_owned),
            headers: parts
                .headers
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_owned(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect(),
            body,
        })
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Whether a request head asks for a WebSocket upgrade.
pub fn is_websocket_upgrade(method: &Method, headers: &HeaderMap) -> bool {
    let has_token = |name: header::HeaderName, token: &str| {
        headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    };

    *method == Method::GET
        && has_token(header::CONNECTION, "upgrade")
        && has_token(header::UPGRADE, "websocket")
        && headers.contains_key(header::SEC_WEBSOCKET_KEY)
}

/// Resolve `.` and `..` segments and collapse repeated slashes.
///
/// The result always starts with `/`; `..` never climbs above the root.
/// A trailing slash is kept.
pub fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }

    let mut out = String::with_capacity(path.len().max(1));
    for s in &segments {
        out.push('/');
        out.push_str(s);
    }
    let trailing = path.ends_with('/') || path.ends_with("/.") || path.ends_with("/..");
    if out.is_empty() || (trailing && !segments.is_empty()) {
        out.push('/');
    }
    out
}
