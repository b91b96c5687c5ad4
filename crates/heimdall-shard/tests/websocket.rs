//! Shards over a real WebSocket against a local mock gateway.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{TOKEN, budget, dispatch, hello, ready, wait_for};
use futures::{SinkExt, StreamExt};
use heimdall_proto::{DecodedEvent, OpCode, decode};
use heimdall_shard::{
    ConnectionState, IdentifyGate, ShardConnection, ShardEvent, ShardHandle, ShardIdentity,
    ShardSettings, WsConnector,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

struct MockGateway {
    listener: TcpListener,
    url: String,
}

impl MockGateway {
    async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        Self { listener, url }
    }

    /// Accept one client and return its socket and request path.
    async fn accept(&self) -> (WebSocketStream<TcpStream>, String) {
        let (stream, _) = self.listener.accept().await.unwrap();
        let mut path = String::new();
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            path = req.uri().to_string();
            Ok(resp)
        };
        let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .unwrap();
        (ws, path)
    }
}

async fn next_request(ws: &mut WebSocketStream<TcpStream>) -> DecodedEvent {
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(bytes))) => return decode(&bytes).unwrap(),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            other => panic!("expected a binary request, got {other:?}"),
        }
    }
}

fn spawn_ws_shard(url: &str) -> (ShardHandle, broadcast::Receiver<ShardEvent>) {
    let gate = Arc::new(IdentifyGate::new(budget(1000, 60_000)));
    let (handle, _task) = ShardConnection::spawn(
        ShardIdentity::new(3, 4),
        &ShardSettings::new(TOKEN, url),
        gate,
        WsConnector::new(),
    )
    .unwrap();
    let events = handle.subscribe();
    (handle, events)
}

#[tokio::test]
async fn handshake_dispatch_and_fatal_close() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let gateway = MockGateway::bind().await;
        let (handle, mut events) = spawn_ws_shard(&gateway.url);
        handle.connect().unwrap();

        let (mut ws, path) = gateway.accept().await;
        assert_eq!(path, "/?v=6&encoding=etf");

        ws.send(Message::Binary(hello(45_000))).await.unwrap();
        let identify = next_request(&mut ws).await;
        assert_eq!(identify.opcode, OpCode::Identify);
        assert_eq!(identify.payload["token"], TOKEN);
        assert_eq!(identify.payload["shard"], serde_json::json!([3, 4]));

        ws.send(Message::Binary(ready(1, "ws-session"))).await.unwrap();
        wait_for(&mut events, |e| matches!(e, ShardEvent::Ready { resumed: false })).await;
        assert_eq!(handle.state(), ConnectionState::Ready);

        let frame = dispatch(2, "MESSAGE_CREATE", serde_json::json!({ "content": "hi" }));
        ws.send(Message::Binary(frame)).await.unwrap();
        let event = wait_for(&mut events, |e| {
            matches!(e, ShardEvent::Dispatch(ev) if ev.sequence == Some(2))
        })
        .await;
        assert!(
            matches!(event, ShardEvent::Dispatch(ev) if ev.payload["content"] == "hi")
        );

        ws.close(Some(CloseFrame {
            code: CloseCode::from(4004),
            reason: "Authentication failed.".into(),
        }))
        .await
        .unwrap();

        let closed = wait_for(&mut events, |e| matches!(e, ShardEvent::Closed { .. })).await;
        assert!(matches!(closed, ShardEvent::Closed { code: 4004, clean: true }));
        wait_for(&mut events, |e| matches!(e, ShardEvent::Error(_))).await;
        assert_eq!(handle.state(), ConnectionState::ReconnectionImpossible);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn client_reset_sends_normal_close() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let gateway = MockGateway::bind().await;
        let (handle, mut events) = spawn_ws_shard(&gateway.url);
        handle.connect().unwrap();

        let (mut ws, _path) = gateway.accept().await;
        ws.send(Message::Binary(hello(45_000))).await.unwrap();
        next_request(&mut ws).await;
        ws.send(Message::Binary(ready(1, "ws-session"))).await.unwrap();
        wait_for(&mut events, |e| matches!(e, ShardEvent::Ready { .. })).await;

        handle.reset().unwrap();

        let code = loop {
            match ws.next().await {
                Some(Ok(Message::Close(Some(frame)))) => break u16::from(frame.code),
                Some(Ok(_)) => {}
                other => panic!("expected a close frame, got {other:?}"),
            }
        };
        assert_eq!(code, 1000);
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn refused_connection_schedules_retry() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let url = {
            let gateway = MockGateway::bind().await;
            gateway.url.clone()
        };
        let (handle, mut events) = spawn_ws_shard(&url);
        handle.connect().unwrap();

        let event = wait_for(&mut events, |e| matches!(e, ShardEvent::Reconnecting { .. })).await;
        assert!(matches!(
            event,
            ShardEvent::Reconnecting { attempt: 1, delay } if delay == Duration::from_secs(1)
        ));
        assert_eq!(handle.state(), ConnectionState::Connecting);
    })
    .await
    .expect("test timed out");
}
