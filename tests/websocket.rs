//! WebSocket upgrades and sessions through a running worker.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

mod common;

use common::{wait_until, SocketSet, TestWorker};
use dispatch_worker::ConnectionId;

fn connection_id(worker: &TestWorker) -> ConnectionId {
    let events = worker.events();
    let open = events
        .iter()
        .find_map(|e| e.strip_prefix("open "))
        .expect("no open event");
    ConnectionId::from(uuid::Uuid::parse_str(open).unwrap())
}

#[tokio::test]
async fn accepted_upgrade_echoes_messages() {
    let sockets = SocketSet::new();
    let addr = sockets.bind();
    let worker = TestWorker::start(&[3], sockets);

    let (mut ws, response) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    assert_eq!(response.status(), 101);
    assert_eq!(response.headers()["server"], "dispatch-test");

    ws.send(Message::text("hello")).await.unwrap();
    assert_eq!(ws.next().await.unwrap().unwrap(), Message::text("hello"));

    ws.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
    assert_eq!(
        ws.next().await.unwrap().unwrap(),
        Message::binary(vec![1u8, 2, 3])
    );
    assert_eq!(worker.handle.sessions().len(), 1);

    ws.close(None).await.unwrap();
    wait_until("close event", || {
        worker.events().iter().any(|e| e.starts_with("close "))
    });
    wait_until("session unregistered", || worker.handle.sessions().is_empty());

    let kinds: Vec<String> = worker
        .events()
        .iter()
        .map(|e| e.split(' ').next().unwrap().to_string())
        .collect();
    assert_eq!(kinds, ["upgrade", "open", "message", "message", "close"]);
    assert!(worker.events()[0].starts_with("upgrade 3 "));
}

#[tokio::test]
async fn refused_or_undecided_upgrade_aborts() {
    let sockets = SocketSet::new();
    let addr = sockets.bind();
    let worker = TestWorker::start(&[1], sockets);

    assert!(connect_async(format!("ws://{addr}/ws-deny")).await.is_err());
    assert!(connect_async(format!("ws://{addr}/elsewhere")).await.is_err());

    let events = worker.events();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.starts_with("upgrade ")));
    assert!(worker.handle.sessions().is_empty());
}

#[tokio::test]
async fn handler_can_close_a_session() {
    let sockets = SocketSet::new();
    let addr = sockets.bind();
    let worker = TestWorker::start(&[1], sockets);

    let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws.send(Message::text("close")).await.unwrap();

    match ws.next().await {
        Some(Ok(Message::Close(_))) | None => {}
        other => panic!("expected close, got {other:?}"),
    }
    wait_until("close event", || {
        worker.events().iter().any(|e| e.starts_with("close "))
    });
}

#[tokio::test]
async fn frames_can_be_pushed_by_connection_id() {
    let sockets = SocketSet::new();
    let addr = sockets.bind();
    let worker = TestWorker::start(&[1], sockets);

    let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    wait_until("open event", || {
        worker.events().iter().any(|e| e.starts_with("open "))
    });

    let id = connection_id(&worker);
    assert!(worker.handle.sessions().send_text(id, "pushed"));
    assert_eq!(ws.next().await.unwrap().unwrap(), Message::text("pushed"));

    // Shutdown closes live sessions.
    let stopped = std::thread::spawn(move || worker.stop());
    let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap();
    assert!(matches!(frame, Some(Ok(Message::Close(_))) | None));
    stopped.join().unwrap().unwrap();
}
