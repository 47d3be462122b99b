//! Integration tests for the signal server: introduction matching and
//! byte-stream pairing with real WebSocket clients.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tandem::{ClientMessage, ServerMessage, SignalConfig, SignalServer, SignalServerHandle};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

type Client =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn start_server(pairing_timeout: Duration) -> SignalServerHandle {
    SignalServer::bind(SignalConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        pairing_timeout,
    })
    .await
    .unwrap()
}

async fn introduction_client(url: &str, id: &str) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(format!("{url}/introduction/{id}"))
        .await
        .unwrap();
    ws
}

async fn connection_client(url: &str, local: &str, remote: &str, key: &str) -> Client {
    let (ws, _) =
        tokio_tungstenite::connect_async(format!("{url}/connection/{local}/{remote}/{key}"))
            .await
            .unwrap();
    ws
}

async fn send_join(ws: &mut Client, keys: &[&str]) {
    let message = ClientMessage::Join {
        join: keys.iter().map(|k| k.to_string()).collect(),
    };
    ws.send(Message::Text(message.encode().unwrap()))
        .await
        .unwrap();
}

async fn expect_introduction(ws: &mut Client) -> (String, Vec<String>) {
    let frame = timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("no introduction within timeout")
        .expect("socket closed")
        .expect("socket error");
    match frame {
        Message::Text(text) => match ServerMessage::decode(&text).unwrap() {
            ServerMessage::Introduction { id, keys } => (id, keys),
        },
        other => panic!("expected text frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_clients_with_shared_interest_are_introduced() {
    let server = start_server(Duration::from_secs(5)).await;
    let url = server.url();

    let mut alice = introduction_client(&url, "alice").await;
    let mut bob = introduction_client(&url, "bob").await;

    send_join(&mut alice, &["key-1"]).await;
    send_join(&mut bob, &["key-1"]).await;

    let (id, keys) = expect_introduction(&mut alice).await;
    assert_eq!(id, "bob");
    assert_eq!(keys, vec!["key-1"]);

    let (id, keys) = expect_introduction(&mut bob).await;
    assert_eq!(id, "alice");
    assert_eq!(keys, vec!["key-1"]);
}

#[tokio::test]
async fn test_no_introduction_without_overlap() {
    let server = start_server(Duration::from_secs(5)).await;
    let url = server.url();

    let mut alice = introduction_client(&url, "alice").await;
    let mut bob = introduction_client(&url, "bob").await;

    send_join(&mut alice, &["key-a"]).await;
    send_join(&mut bob, &["key-b"]).await;

    let result = timeout(Duration::from_millis(300), alice.next()).await;
    assert!(result.is_err(), "unexpected introduction: {result:?}");
}

#[tokio::test]
async fn test_shared_keys_reported_together() {
    let server = start_server(Duration::from_secs(5)).await;
    let url = server.url();

    let mut alice = introduction_client(&url, "alice").await;
    let mut bob = introduction_client(&url, "bob").await;

    send_join(&mut alice, &["k1", "k2", "k3"]).await;
    send_join(&mut bob, &["k2", "k1"]).await;

    let (_, mut keys) = expect_introduction(&mut alice).await;
    keys.sort();
    assert_eq!(keys, vec!["k1", "k2"]);
}

#[tokio::test]
async fn test_late_joiner_is_introduced() {
    let server = start_server(Duration::from_secs(5)).await;
    let url = server.url();

    let mut alice = introduction_client(&url, "alice").await;
    send_join(&mut alice, &["key-1"]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut bob = introduction_client(&url, "bob").await;
    send_join(&mut bob, &["key-1"]).await;

    let (id, _) = expect_introduction(&mut alice).await;
    assert_eq!(id, "bob");
    let (id, _) = expect_introduction(&mut bob).await;
    assert_eq!(id, "alice");
}

#[tokio::test]
async fn test_connection_pipe_carries_frames_both_ways() {
    let server = start_server(Duration::from_secs(5)).await;
    let url = server.url();

    let mut alice = connection_client(&url, "alice", "bob", "deadbeef").await;
    let mut bob = connection_client(&url, "bob", "alice", "deadbeef").await;

    alice
        .send(Message::Text("hello from alice".to_string()))
        .await
        .unwrap();
    let frame = timeout(Duration::from_secs(2), bob.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(frame, Message::Text("hello from alice".to_string()));

    bob.send(Message::Text("hello from bob".to_string()))
        .await
        .unwrap();
    let frame = timeout(Duration::from_secs(2), alice.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(frame, Message::Text("hello from bob".to_string()));
}

#[tokio::test]
async fn test_pipe_preserves_frame_order() {
    let server = start_server(Duration::from_secs(5)).await;
    let url = server.url();

    let mut alice = connection_client(&url, "alice", "bob", "k").await;
    let mut bob = connection_client(&url, "bob", "alice", "k").await;

    for i in 0..20 {
        alice.send(Message::Text(format!("msg-{i}"))).await.unwrap();
    }
    for i in 0..20 {
        let frame = timeout(Duration::from_secs(2), bob.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(frame, Message::Text(format!("msg-{i}")));
    }
}

#[tokio::test]
async fn test_pipe_close_propagates() {
    let server = start_server(Duration::from_secs(5)).await;
    let url = server.url();

    let mut alice = connection_client(&url, "alice", "bob", "k").await;
    let mut bob = connection_client(&url, "bob", "alice", "k").await;

    alice.close(None).await.unwrap();

    let frame = timeout(Duration::from_secs(2), bob.next()).await.unwrap();
    match frame {
        Some(Ok(Message::Close(_))) | None => {}
        other => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn test_pairing_timeout_closes_lone_socket() {
    let server = start_server(Duration::from_millis(200)).await;
    let url = server.url();

    let mut alice = connection_client(&url, "alice", "bob", "k").await;

    let frame = timeout(Duration::from_secs(2), alice.next())
        .await
        .expect("socket not closed after pairing timeout");
    match frame {
        Some(Ok(Message::Close(Some(close)))) => {
            assert_eq!(close.code, CloseCode::Library(4408));
        }
        Some(Ok(Message::Close(None))) | None => {}
        other => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn test_pairing_after_timeout_still_works() {
    let server = start_server(Duration::from_millis(100)).await;
    let url = server.url();

    // First request times out alone.
    let mut first = connection_client(&url, "alice", "bob", "k").await;
    let _ = timeout(Duration::from_secs(1), first.next()).await;

    // A fresh reciprocal pair still pipes.
    let mut alice = connection_client(&url, "alice", "bob", "k").await;
    let mut bob = connection_client(&url, "bob", "alice", "k").await;
    alice.send(Message::Text("ping".to_string())).await.unwrap();
    let frame = timeout(Duration::from_secs(2), bob.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(frame, Message::Text("ping".to_string()));
}
