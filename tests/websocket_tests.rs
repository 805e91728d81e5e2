extern crate intermock;

use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use intermock::{
    EventKind, ProxyEvent, RequestMatcher, ResponseSpec, ProxyServerBuilder, WebSocketRule,
    WebSocketStep,
};
use tokio_tungstenite::tungstenite::Message;

/// The echo step reflects every message back to the client.
#[tokio::test]
async fn websocket_echo_test() {
    // Arrange
    let _ = env_logger::try_init();
    let server = ProxyServerBuilder::new().start().await.unwrap();
    server
        .add_websocket_rules(vec![WebSocketRule::new(
            vec![RequestMatcher::PathPrefix("/ws".to_string())],
            WebSocketStep::Echo,
        )])
        .unwrap();

    let url = format!("ws://127.0.0.1:{}/ws", server.port());

    // Act
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    ws.send(Message::text("ping!")).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();

    // Assert
    assert_eq!(reply.into_text().unwrap().as_str(), "ping!");

    ws.close(None).await.unwrap();
}

/// Message events fire for received and sent frames with the upgrade
/// request's id.
#[tokio::test]
async fn websocket_message_events_test() {
    // Arrange
    let _ = env_logger::try_init();
    let server = ProxyServerBuilder::new().start().await.unwrap();
    server
        .add_websocket_rules(vec![WebSocketRule::new(
            vec![RequestMatcher::Wildcard],
            WebSocketStep::Echo,
        )])
        .unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sent = Arc::new(Mutex::new(Vec::new()));
    let upgrades = Arc::new(Mutex::new(Vec::new()));

    let capture = upgrades.clone();
    server.on(
        EventKind::WebSocketRequest,
        Arc::new(move |event| {
            if let ProxyEvent::WebSocketRequest(request) = event {
                capture.lock().unwrap().push(request.id().to_string());
            }
        }),
    );
    let capture = received.clone();
    server.on(
        EventKind::WebSocketMessageReceived,
        Arc::new(move |event| {
            if let ProxyEvent::WebSocketMessageReceived { request_id, data, .. } = event {
                capture
                    .lock()
                    .unwrap()
                    .push((request_id.clone(), data.clone()));
            }
        }),
    );
    let capture = sent.clone();
    server.on(
        EventKind::WebSocketMessageSent,
        Arc::new(move |event| {
            if let ProxyEvent::WebSocketMessageSent { request_id, data, .. } = event {
                capture
                    .lock()
                    .unwrap()
                    .push((request_id.clone(), data.clone()));
            }
        }),
    );

    let url = format!("ws://127.0.0.1:{}/events", server.port());

    // Act
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    ws.send(Message::text("observable")).await.unwrap();
    let _ = ws.next().await.unwrap().unwrap();
    ws.close(None).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    // Assert
    let upgrades = upgrades.lock().unwrap().clone();
    let received = received.lock().unwrap().clone();
    let sent = sent.lock().unwrap().clone();

    assert_eq!(upgrades.len(), 1);
    assert_eq!(received.len(), 1);
    assert_eq!(sent.len(), 1);
    assert_eq!(received[0].0, upgrades[0]);
    assert_eq!(received[0].1.as_ref(), b"observable");
    assert_eq!(sent[0].1.as_ref(), b"observable");
}

/// The reject step refuses the upgrade with the configured response.
#[tokio::test]
async fn websocket_reject_test() {
    // Arrange
    let _ = env_logger::try_init();
    let server = ProxyServerBuilder::new().start().await.unwrap();
    server
        .add_websocket_rules(vec![WebSocketRule::new(
            vec![RequestMatcher::Wildcard],
            WebSocketStep::Reject(ResponseSpec::new(403).with_body("not welcome")),
        )])
        .unwrap();

    let url = format!("ws://127.0.0.1:{}/rejected", server.port());

    // Act
    let result = tokio_tungstenite::connect_async(url.as_str()).await;

    // Assert
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 403);
        }
        other => panic!("expected an HTTP rejection, got: {:?}", other.map(|_| ())),
    }
}

/// Accept-and-close completes the handshake, then closes immediately.
#[tokio::test]
async fn websocket_accept_and_close_test() {
    // Arrange
    let _ = env_logger::try_init();
    let server = ProxyServerBuilder::new().start().await.unwrap();
    server
        .add_websocket_rules(vec![WebSocketRule::new(
            vec![RequestMatcher::Wildcard],
            WebSocketStep::AcceptAndClose,
        )])
        .unwrap();

    let url = format!("ws://127.0.0.1:{}/closing", server.port());

    // Act
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let frame = ws.next().await;

    // Assert: either a close frame or a clean end of stream.
    match frame {
        Some(Ok(Message::Close(_))) | None => {}
        other => panic!("expected close, got: {:?}", other),
    }
}

/// Upgrades with no matching rule are refused with a 503.
#[tokio::test]
async fn websocket_unmatched_test() {
    // Arrange
    let _ = env_logger::try_init();
    let server = ProxyServerBuilder::new().start().await.unwrap();

    let url = format!("ws://127.0.0.1:{}/nothing", server.port());

    // Act
    let result = tokio_tungstenite::connect_async(url.as_str()).await;

    // Assert
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 503);
        }
        other => panic!("expected an HTTP rejection, got: {:?}", other.map(|_| ())),
    }
}

/// The passthrough step relays frames to an upstream websocket server and
/// back.
#[tokio::test]
async fn websocket_passthrough_test() {
    // Arrange: an upstream echo websocket.
    let _ = env_logger::try_init();
    let upstream = ProxyServerBuilder::new().start().await.unwrap();
    upstream
        .add_websocket_rules(vec![WebSocketRule::new(
            vec![RequestMatcher::Wildcard],
            WebSocketStep::Echo,
        )])
        .unwrap();

    let front = ProxyServerBuilder::new().start().await.unwrap();
    front
        .add_websocket_rules(vec![WebSocketRule::new(
            vec![RequestMatcher::Wildcard],
            WebSocketStep::PassThrough {
                target: Some(format!("ws://127.0.0.1:{}/echoed", upstream.port())),
                proxy: None,
                tls: Default::default(),
            },
        )])
        .unwrap();

    let url = format!("ws://127.0.0.1:{}/through", front.port());

    // Act
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    ws.send(Message::text("relayed")).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();

    // Assert
    assert_eq!(reply.into_text().unwrap().as_str(), "relayed");

    ws.close(None).await.unwrap();
}
