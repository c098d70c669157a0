//! Rendering handler responses onto the wire.
//!
//! # Responsibilities
//! - Apply transport defaults (200 status, empty body)
//! - Reconcile a handler-declared `Content-Length` with the real body
//! - Stamp the `server` header on every response
//!
//! # Design Decisions
//! - A declared length is never copied verbatim: hyper computes the header
//!   from the body actually sent
//! - Declared shorter than the body truncates; declared longer only warns
//! - Invalid header names or values are dropped with a warning, the rest of
//!   the response still goes out

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderName, HeaderValue, Response, StatusCode};

use crate::dispatch::outcome::HttpResponse;

/// Body text for handler faults.
pub const INTERNAL_ERROR_BODY: &str = "Internal server error";

/// Apply the content-length policy.
///
/// Removes every `Content-Length` entry from `headers` and returns the body
/// to send.
pub fn apply_content_length(headers: &mut Vec<(String, String)>, body: Bytes) -> Bytes {
    let mut declared = None;
    headers.retain(|(name, value)| {
        if !name.eq_ignore_ascii_case("content-length") {
            return true;
        }
        if declared.is_none() {
            match value.trim().parse::<usize>() {
                Ok(len) => declared = Some(len),
                Err(_) => tracing::warn!(value = %value, "Ignoring unparseable Content-Length"),
            }
        }
        false
    });

    match declared {
        Some(len) if body.len() > len => {
            tracing::debug!(declared = len, actual = body.len(), "Truncating body to declared Content-Length");
            body.slice(..len)
        }
        Some(len) if body.len() < len => {
            tracing::warn!(
                declared = len,
                actual = body.len(),
                "Body shorter than declared Content-Length, sending actual length"
            );
            body
        }
        _ => body,
    }
}

/// Build the wire response for a handler-built response.
pub fn render(response: HttpResponse, server_name: &str) -> Response<Body> {
    let HttpResponse {
        status,
        mut headers,
        body,
    } = response;

    let status = match status {
        None => StatusCode::OK,
        Some(code) => StatusCode::from_u16(code).unwrap_or_else(|_| {
            tracing::warn!(status = code, "Handler returned an invalid status, sending 500");
            StatusCode::INTERNAL_SERVER_ERROR
        }),
    };
    let body = apply_content_length(&mut headers, body.unwrap_or_default());

    let mut out = Response::new(Body::from(body));
    *out.status_mut() = status;
    let map = out.headers_mut();
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => tracing::warn!(header = %name, "Dropping invalid response header"),
        }
    }
    stamp_server(&mut out, server_name);
    out
}

/// A plain-text response produced by the transport itself.
pub fn plain(status: StatusCode, body: &'static str, server_name: &str) -> Response<Body> {
    let mut out = Response::new(Body::from(body));
    *out.status_mut() = status;
    out.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    stamp_server(&mut out, server_name);
    out
}

/// The response sent for a handler fault.
pub fn internal_error(server_name: &str) -> Response<Body> {
    plain(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_BODY, server_name)
}

pub fn stamp_server<B>(response: &mut Response<B>, server_name: &str) {
    if let Ok(value) = HeaderValue::from_str(server_name) {
        response.headers_mut().insert(header::SERVER, value);
    }
}
