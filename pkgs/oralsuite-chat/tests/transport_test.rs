//! WebSocket transport against a local server
//!
//! - The credential travels in the upgrade request
//! - A refused credential ends the channel without retries
//! - A dropped socket reconnects and hands back unsent messages

use futures::StreamExt;
use oralsuite_chat::{
    ChannelEvent, ChatConfig, ClientFrame, Connector, Credential, SendMessageRequest,
    TransportEvent, WebSocketConnector,
};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, StatusCode};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, accept_hdr_async};

async fn bind() -> (TcpListener, WebSocketConnector) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = ChatConfig {
        socket_url: Some(format!("ws://{}/ws", listener.local_addr().unwrap())),
        reconnect_delay: Duration::from_millis(300),
        reconnect_delay_max: Duration::from_millis(300),
        ..Default::default()
    };
    (listener, WebSocketConnector::new(&config).unwrap())
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> Option<TransportEvent> {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("Timed out waiting for channel event")
        .map(|e| e.event)
}

fn send_frame(content: &str) -> SendMessageRequest {
    SendMessageRequest {
        conversation_id: "c1".into(),
        content: content.into(),
    }
}

#[tokio::test]
async fn test_handshake_carries_bearer_credential() {
    let (listener, connector) = bind().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut authorization = None;
        let socket = accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                authorization = request
                    .headers()
                    .get(AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                Ok(response)
            },
        )
        .await
        .unwrap();
        (authorization, socket)
    });

    let (tx, mut events) = mpsc::unbounded_channel();
    let handle = connector.open(1, &Credential::new("secret"), tx);
    assert_eq!(next_event(&mut events).await, Some(TransportEvent::Connected));

    let (authorization, mut socket) = server.await.unwrap();
    assert_eq!(authorization.as_deref(), Some("Bearer secret"));

    let join = ClientFrame::JoinConversation("c1".into());
    handle.send(join.clone()).unwrap();
    let received = socket.next().await.unwrap().unwrap();
    assert_eq!(received, WsMessage::Text(join.encode().unwrap()));
}

#[tokio::test]
async fn test_refused_credential_is_not_retried() {
    let (listener, connector) = bind().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let refused = accept_hdr_async(
            stream,
            |_: &Request, _: Response| -> Result<Response, ErrorResponse> {
                let mut response = ErrorResponse::new(Some("invalid token".into()));
                *response.status_mut() = StatusCode::UNAUTHORIZED;
                Err(response)
            },
        )
        .await;
        assert!(refused.is_err());

        // Would accept a second attempt if one came
        tokio::time::timeout(Duration::from_secs(1), listener.accept())
            .await
            .is_err()
    });

    let (tx, mut events) = mpsc::unbounded_channel();
    let _handle = connector.open(1, &Credential::new("expired"), tx);

    match next_event(&mut events).await {
        Some(TransportEvent::ConnectFailed { unauthorized, .. }) => assert!(unauthorized),
        other => panic!("Expected a refused handshake, got {:?}", other),
    }
    // The worker is gone and nothing else arrives
    assert_eq!(next_event(&mut events).await, None);
    assert!(server.await.unwrap());
}

#[tokio::test]
async fn test_dropped_socket_reconnects_and_returns_unsent_messages() {
    let (listener, connector) = bind().await;
    let (received_tx, mut received) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut first = accept_async(stream).await.unwrap();
        let _ = first.close(None).await;

        let (stream, _) = listener.accept().await.unwrap();
        let mut second = accept_async(stream).await.unwrap();
        while let Some(Ok(message)) = second.next().await {
            if let WsMessage::Text(text) = message {
                let _ = received_tx.send(text.to_string());
            }
        }
    });

    let (tx, mut events) = mpsc::unbounded_channel();
    let handle = connector.open(1, &Credential::new("secret"), tx);
    assert_eq!(next_event(&mut events).await, Some(TransportEvent::Connected));
    assert!(matches!(
        next_event(&mut events).await,
        Some(TransportEvent::Disconnected { .. })
    ));

    // Queued while the transport waits to reconnect
    handle
        .send(ClientFrame::JoinConversation("c1".into()))
        .unwrap();
    handle
        .send(ClientFrame::SendMessage(send_frame("Margins look short")))
        .unwrap();

    assert_eq!(
        next_event(&mut events).await,
        Some(TransportEvent::Undelivered(send_frame("Margins look short")))
    );
    assert_eq!(next_event(&mut events).await, Some(TransportEvent::Connected));

    let frame = ClientFrame::SendMessage(send_frame("Second try"));
    handle.send(frame.clone()).unwrap();
    let text = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(text, frame.encode().unwrap());
}
