//! Integration tests for the alert feed client against an in-process
//! WebSocket server.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use watchdesk::protocol::{ChannelId, ClientCommand};
use watchdesk::router::EventRouter;
use watchdesk::transport::backoff::ReconnectPolicy;
use watchdesk::transport::{AlertFeedClient, ConnectionState, TransportConfig};

fn test_config(port: u16) -> TransportConfig {
    TransportConfig {
        url: format!("ws://127.0.0.1:{port}/ws/alerts"),
        heartbeat_interval: Duration::from_secs(5),
        reconnect: ReconnectPolicy::new(vec![Duration::from_millis(50)], 5),
        outbound_queue_cap: 50,
    }
}

async fn bind() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Wait until the client's connection state matches, or panic on timeout.
async fn wait_for_state(client: &AlertFeedClient, expected: ConnectionState) {
    let mut rx = client.watch_state();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if *rx.borrow() == expected {
                return;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for state {expected}"));
}

fn alert_frame(id: &str) -> String {
    format!(
        r#"{{"type":"new_alert","data":{{"id":"{id}","camera_id":"cam-1","weapon_type":"pistol","confidence":0.92}}}}"#
    )
}

#[tokio::test]
async fn test_subscribe_handshake_and_alert_dispatch() {
    let (listener, port) = bind().await;

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();

        ws.send(Message::Text(
            r#"{"type":"connected","message":"welcome"}"#.into(),
        ))
        .await
        .unwrap();

        // The queued subscribe command flushes on open.
        let text = loop {
            let msg = ws.next().await.unwrap().unwrap();
            if let Message::Text(text) = msg {
                break text;
            }
        };
        assert!(text.contains("subscribe_alerts"), "got {text}");

        ws.send(Message::Text(
            r#"{"type":"subscribed","channel":"alerts"}"#.into(),
        ))
        .await
        .unwrap();
        ws.send(Message::Text(alert_frame("alert-1").into()))
            .await
            .unwrap();

        // Stay open until the client closes deliberately.
        while let Some(Ok(msg)) = ws.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    let router = EventRouter::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _guard = router.on_alert(move |alert| {
        let _ = tx.send(alert.id.clone());
    });

    let client = AlertFeedClient::new(test_config(port), "itest-client", router.clone());
    client.connect();
    client.subscribe(ChannelId::Alerts).await;

    let id = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(id, "alert-1");
    assert_eq!(client.state(), ConnectionState::Open);
    assert_eq!(client.reconnect_attempts(), 0);

    client.disconnect().await;
    let _ = tokio::time::timeout(Duration::from_secs(2), server).await;
}

#[tokio::test]
async fn test_connect_url_carries_client_id_to_server() {
    let (listener, port) = bind().await;
    let (uri_tx, uri_rx) = tokio::sync::oneshot::channel::<String>();

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut uri_tx = Some(uri_tx);
        let mut ws = tokio_tungstenite::accept_hdr_async(
            socket,
            move |req: &tokio_tungstenite::tungstenite::handshake::server::Request,
                  resp: tokio_tungstenite::tungstenite::handshake::server::Response| {
                if let Some(tx) = uri_tx.take() {
                    let _ = tx.send(req.uri().to_string());
                }
                Ok(resp)
            },
        )
        .await
        .unwrap();

        while let Some(Ok(msg)) = ws.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    let client = AlertFeedClient::new(test_config(port), "stable-id-42", EventRouter::new());
    client.connect();
    wait_for_state(&client, ConnectionState::Open).await;

    let uri = tokio::time::timeout(Duration::from_secs(2), uri_rx)
        .await
        .unwrap()
        .unwrap();
    assert!(uri.contains("client_id=stable-id-42"), "uri was {uri}");

    client.disconnect().await;
    let _ = tokio::time::timeout(Duration::from_secs(2), server).await;
}

#[tokio::test]
async fn test_queued_sends_flush_in_order_on_open() {
    let (listener, port) = bind().await;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            match msg {
                Message::Text(text) => {
                    let _ = tx.send(text.to_string());
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    let client = AlertFeedClient::new(test_config(port), "cid", EventRouter::new());

    // Queued while closed; must flush in arrival order.
    client.send(ClientCommand::GetStats).await;
    client.subscribe(ChannelId::Camera("cam-2".into())).await;
    client.connect();
    wait_for_state(&client, ConnectionState::Open).await;

    let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(first.contains("get_stats"), "first was {first}");
    assert!(second.contains("subscribe_camera"), "second was {second}");

    client.disconnect().await;
    let _ = tokio::time::timeout(Duration::from_secs(2), server).await;
}

#[tokio::test]
async fn test_reconnects_after_server_drop() {
    let (listener, port) = bind().await;
    let accepts = Arc::new(AtomicU32::new(0));

    let accepts_counter = accepts.clone();
    let server = tokio::spawn(async move {
        // First connection: accept then drop immediately.
        let (socket, _) = listener.accept().await.unwrap();
        accepts_counter.fetch_add(1, Ordering::SeqCst);
        let ws = tokio_tungstenite::accept_async(socket).await.unwrap();
        drop(ws);

        // Second connection: stay open.
        let (socket, _) = listener.accept().await.unwrap();
        accepts_counter.fetch_add(1, Ordering::SeqCst);
        let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    let client = AlertFeedClient::new(test_config(port), "cid", EventRouter::new());
    client.connect();

    tokio::time::timeout(Duration::from_secs(5), async {
        while accepts.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("client never reconnected");

    wait_for_state(&client, ConnectionState::Open).await;
    // The counter resets on a successful open.
    assert_eq!(client.reconnect_attempts(), 0);

    client.disconnect().await;
    let _ = tokio::time::timeout(Duration::from_secs(2), server).await;
}

#[tokio::test]
async fn test_heartbeat_timeout_forces_reconnect() {
    let (listener, port) = bind().await;
    let accepts = Arc::new(AtomicU32::new(0));

    let accepts_counter = accepts.clone();
    let server = tokio::spawn(async move {
        loop {
            let (socket, _) = listener.accept().await.unwrap();
            accepts_counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                // Read and ignore everything; never answer pings.
                let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
                while let Some(Ok(msg)) = ws.next().await {
                    if matches!(msg, Message::Close(_)) {
                        break;
                    }
                }
            });
        }
    });

    let config = TransportConfig {
        heartbeat_interval: Duration::from_millis(100),
        ..test_config(port)
    };
    let client = AlertFeedClient::new(config, "cid", EventRouter::new());
    client.connect();

    // No pong ever arrives, so the connection force-closes after roughly
    // 2x the heartbeat interval and the client dials again.
    tokio::time::timeout(Duration::from_secs(5), async {
        while accepts.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("heartbeat timeout never triggered a reconnect");

    client.disconnect().await;
    server.abort();
}

#[tokio::test]
async fn test_deliberate_disconnect_suppresses_reconnect() {
    let (listener, port) = bind().await;
    let accepts = Arc::new(AtomicU32::new(0));

    let accepts_counter = accepts.clone();
    let server = tokio::spawn(async move {
        loop {
            let (socket, _) = listener.accept().await.unwrap();
            accepts_counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
                while let Some(Ok(msg)) = ws.next().await {
                    if matches!(msg, Message::Close(_)) {
                        break;
                    }
                }
            });
        }
    });

    let client = AlertFeedClient::new(test_config(port), "cid", EventRouter::new());
    client.connect();
    wait_for_state(&client, ConnectionState::Open).await;

    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Closed);

    // Several backoff periods pass without a new dial.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(accepts.load(Ordering::SeqCst), 1);

    server.abort();
}

#[tokio::test]
async fn test_attempt_cap_parks_client_until_manual_connect() {
    // Bind then drop so the port refuses connections.
    let (listener, port) = bind().await;
    drop(listener);

    let config = TransportConfig {
        reconnect: ReconnectPolicy::new(vec![Duration::from_millis(10)], 2),
        ..test_config(port)
    };
    let client = AlertFeedClient::new(config, "cid", EventRouter::new());

    client.connect();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if client.state() == ConnectionState::Closed && client.reconnect_attempts() > 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client never exhausted its attempts");
    let attempts_after_giving_up = client.reconnect_attempts();

    // The supervisor is gone; no attempts accrue on their own.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.reconnect_attempts(), attempts_after_giving_up);

    // Manual reconnect starts a fresh supervisor with a zeroed counter.
    let mut state_rx = client.watch_state();
    client.connect();
    tokio::time::timeout(Duration::from_secs(2), state_rx.changed())
        .await
        .expect("manual connect never restarted the supervisor")
        .unwrap();

    client.disconnect().await;
}
