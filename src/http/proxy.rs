//! Upstream relay for `Proxy` outcomes.
//!
//! # Design Decisions
//! - The target URL is the complete upstream location; the client's path is
//!   not appended
//! - Hop-by-hop headers are stripped in both directions
//! - `Host` is kept when preserving, otherwise the client sets it from the
//!   upstream authority
//! - An unusable URL aborts the connection; an upstream failure is a 502

use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{header, request::Parts, HeaderMap, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use url::Url;

use crate::dispatch::outcome::ProxyTarget;
use crate::http::response;

pub type UpstreamClient = Client<HttpConnector, Body>;

/// Error type for proxying.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("unusable proxy target {url:?}: {reason}")]
    InvalidTarget { url: String, reason: String },

    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),
}

const HOP_BY_HOP: [header::HeaderName; 6] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

pub fn upstream_client(connect_timeout: Duration) -> UpstreamClient {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(connect_timeout));
    Client::builder(TokioExecutor::new()).build(connector)
}

/// Resolve the upstream URI for a target.
pub fn target_uri(target: &ProxyTarget) -> Result<Uri, ProxyError> {
    let invalid = |reason: &str| ProxyError::InvalidTarget {
        url: target.url.clone(),
        reason: reason.to_string(),
    };

    let url = Url::parse(&target.url).map_err(|e| invalid(&e.to_string()))?;
    if url.scheme() != "http" {
        return Err(invalid("only http:// targets are supported"));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host"));
    }
    url.as_str()
        .parse::<Uri>()
        .map_err(|e| invalid(&e.to_string()))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
}

/// Build the upstream request from the client's request head and body.
pub fn upstream_request(
    target: &ProxyTarget,
    parts: &Parts,
    body: Bytes,
) -> Result<Request<Body>, ProxyError> {
    let uri = target_uri(target)?;
    let mut request = Request::new(Body::from(body));
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = uri;

    let headers = request.headers_mut();
    headers.clone_from(&parts.headers);
    strip_hop_by_hop(headers);
    if !target.preserve_host {
        headers.remove(header::HOST);
    }
    Ok(request)
}

/// Relay the request and return the upstream response, or a 502.
pub async fn forward(
    client: &UpstreamClient,
    request: Request<Body>,
    server_name: &str,
) -> Response<Body> {
    let uri = request.uri().clone();
    match client.request(request).await {
        Ok(upstream) => {
            let (mut parts, body) = upstream.into_parts();
            strip_hop_by_hop(&mut parts.headers);
            let mut out = Response::from_parts(parts, Body::new(body));
            response::stamp_server(&mut out, server_name);
            out
        }
        Err(e) => {
            tracing::warn!(upstream = %uri, error = %e, "Upstream error");
            response::plain(StatusCode::BAD_GATEWAY, "Upstream request failed", server_name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(host: &str) -> Parts {
        Request::post("/original?x=1")
            .header("host", host)
            .header("connection", "keep-alive")
            .header("x-trace", "abc")
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    #[test]
    fn preserves_host_by_default() {
        let target = ProxyTarget::new("http://127.0.0.1:9000/api?y=2");
        let req = upstream_request(&target, &parts("front.example"), Bytes::new()).unwrap();

        assert_eq!(req.uri().to_string(), "http://127.0.0.1:9000/api?y=2");
        assert_eq!(req.method(), "POST");
        assert_eq!(req.headers()[header::HOST], "front.example");
        assert_eq!(req.headers()["x-trace"], "abc");
        assert!(req.headers().get(header::CONNECTION).is_none());
    }

    #[test]
    fn rewrite_drops_client_host() {
        let target = ProxyTarget::new("http://127.0.0.1:9000/").rewrite_host();
        let req = upstream_request(&target, &parts("front.example"), Bytes::new()).unwrap();
        assert!(req.headers().get(header::HOST).is_none());
    }

    #[test]
    fn rejects_unusable_targets() {
        for url in ["not a url", "https://secure.example/", "unix:/tmp/sock"] {
            assert!(
                matches!(
                    target_uri(&ProxyTarget::new(url)),
                    Err(ProxyError::InvalidTarget { .. })
                ),
                "{url}"
            );
        }
    }

    #[tokio::test]
    async fn unreachable_upstream_is_bad_gateway() {
        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = closed.local_addr().unwrap();
        drop(closed);

        let client = upstream_client(Duration::from_secs(1));
        let target = ProxyTarget::new(format!("http://{addr}/"));
        let req = upstream_request(&target, &parts("x"), Bytes::new()).unwrap();

        let response = forward(&client, req, "test/1").await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
