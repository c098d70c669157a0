//! Request dispatch through a running worker.

use std::time::Duration;

use axum::http::StatusCode;
use tokio::net::TcpStream;

mod common;

use common::{client, raw_exchange, test_config, SocketSet, TestWorker};

#[tokio::test]
async fn handler_fault_answers_500_and_worker_keeps_serving() {
    let sockets = SocketSet::new();
    let addr = sockets.bind();
    let _worker = TestWorker::start(&[1], sockets);
    let client = client();

    for path in ["fail", "panic"] {
        let res = client
            .get(format!("http://{addr}/{path}"))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR, "{path}");
        assert_eq!(res.text().await.unwrap(), "Internal server error");
    }

    let res = client
        .get(format!("http://{addr}/next"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["server"], "dispatch-test");
    assert_eq!(
        res.text().await.unwrap(),
        "listener=1 path=/next query=None body="
    );
}

#[tokio::test]
async fn declared_length_longer_than_body_sends_actual_body() {
    let sockets = SocketSet::new();
    let addr = sockets.bind();
    let _worker = TestWorker::start(&[1], sockets);

    let res = client()
        .get(format!("http://{addr}/short"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["content-length"], "3");
    assert_eq!(res.text().await.unwrap(), "abc");
}

#[tokio::test]
async fn declared_length_shorter_than_body_truncates() {
    let sockets = SocketSet::new();
    let addr = sockets.bind();
    let _worker = TestWorker::start(&[1], sockets);

    let res = client()
        .get(format!("http://{addr}/long"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.text().await.unwrap(), "hel");
}

#[tokio::test]
async fn missing_outcome_is_no_content() {
    let sockets = SocketSet::new();
    let addr = sockets.bind();
    let _worker = TestWorker::start(&[1], sockets);

    let res = client()
        .delete(format!("http://{addr}/empty"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert!(res.text().await.unwrap().is_empty());
}

#[tokio::test]
async fn abort_closes_the_connection() {
    let sockets = SocketSet::new();
    let addr = sockets.bind();
    let _worker = TestWorker::start(&[1], sockets);

    let result = client()
        .get(format!("http://{addr}/abort"))
        .send()
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn unsupported_method_is_rejected_without_dispatch() {
    let sockets = SocketSet::new();
    let addr = sockets.bind();
    let _worker = TestWorker::start(&[1], sockets);

    let method = reqwest::Method::from_bytes(b"PROPFIND").unwrap();
    let res = client()
        .request(method, format!("http://{addr}/fail"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let mut config = test_config();
    config.http.max_body_size = 16;
    let sockets = SocketSet::new();
    let addr = sockets.bind();
    let _worker = TestWorker::start_with(config, &[1], sockets);
    let client = client();

    let res = client
        .post(format!("http://{addr}/upload"))
        .body(vec![b'x'; 64])
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);

    let res = client
        .post(format!("http://{addr}/upload"))
        .body("small")
        .send()
        .await
        .unwrap();
    assert_eq!(
        res.text().await.unwrap(),
        "listener=1 path=/upload query=None body=small"
    );
}

#[tokio::test]
async fn request_record_normalizes_path_and_keeps_empty_query() {
    let sockets = SocketSet::new();
    let addr = sockets.bind();
    let _worker = TestWorker::start(&[7], sockets);

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let res = raw_exchange(
        &mut stream,
        "GET /a/./b/../c? HTTP/1.1\r\nHost: test\r\n\r\n",
    )
    .await;
    assert_eq!(res.status, 200);
    assert_eq!(res.text(), "listener=7 path=/a/c query=Some(\"\") body=");

    let res = raw_exchange(
        &mut stream,
        "GET /x//y/?k=v HTTP/1.1\r\nHost: test\r\n\r\n",
    )
    .await;
    assert_eq!(res.text(), "listener=7 path=/x/y/ query=Some(\"k=v\") body=");
}

#[tokio::test]
async fn proxy_outcome_relays_to_upstream() {
    let upstream = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let app = axum::Router::new().route(
        "/up",
        axum::routing::get(|headers: axum::http::HeaderMap| async move {
            format!(
                "upstream host={}",
                headers
                    .get("host")
                    .and_then(|h| h.to_str().ok())
                    .unwrap_or("-")
            )
        }),
    );
    tokio::spawn(async move {
        axum::serve(upstream, app).await.unwrap();
    });

    let sockets = SocketSet::new();
    let addr = sockets.bind();
    let _worker = TestWorker::start(&[1], sockets);

    let res = client()
        .get(format!("http://{addr}/proxy?to=http://{upstream_addr}/up"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), format!("upstream host={addr}"));
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway() {
    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = closed.local_addr().unwrap();
    drop(closed);

    let sockets = SocketSet::new();
    let addr = sockets.bind();
    let _worker = TestWorker::start(&[1], sockets);

    let res = client()
        .get(format!("http://{addr}/proxy?to=http://{dead}/"))
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn unusable_proxy_target_aborts() {
    let sockets = SocketSet::new();
    let addr = sockets.bind();
    let _worker = TestWorker::start(&[1], sockets);

    let result = client()
        .get(format!("http://{addr}/proxy?to=ftp://files.example/"))
        .send()
        .await;
    assert!(result.is_err());
}
