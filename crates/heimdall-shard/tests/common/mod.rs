//! Shared helpers for driving shards over the in-memory transport.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use heimdall_proto::{DecodedEvent, OpCode, decode, encode};
use heimdall_shard::shard::{MemoryListener, MemoryServer, OutboundFrame};
use heimdall_shard::{
    IdentifyBudget, IdentifyGate, MemoryConnector, ShardConnection, ShardEvent, ShardHandle,
    ShardIdentity, ShardSettings,
};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub const TOKEN: &str = "test-token";
pub const GATEWAY: &str = "memory://gateway";

/// Long enough that no heartbeat fires during a test unless asked for.
pub const QUIET_HEARTBEAT_MS: u64 = 600_000;

pub struct TestShard {
    pub handle: ShardHandle,
    pub listener: MemoryListener,
    pub events: broadcast::Receiver<ShardEvent>,
    pub gate: Arc<IdentifyGate>,
    pub task: JoinHandle<()>,
}

pub fn budget(remaining: u32, reset_after_ms: u64) -> IdentifyBudget {
    IdentifyBudget {
        total: 1000,
        remaining,
        reset_after: Duration::from_millis(reset_after_ms),
    }
}

pub fn spawn_shard_with(settings: &ShardSettings, budget: IdentifyBudget) -> TestShard {
    let (connector, listener) = MemoryConnector::pair();
    let gate = Arc::new(IdentifyGate::new(budget));
    let (handle, task) =
        ShardConnection::spawn(ShardIdentity::new(0, 1), settings, Arc::clone(&gate), connector)
            .expect("spawn shard");
    let events = handle.subscribe();
    TestShard {
        handle,
        listener,
        events,
        gate,
        task,
    }
}

pub fn spawn_shard() -> TestShard {
    spawn_shard_with(&ShardSettings::new(TOKEN, GATEWAY), budget(1000, 60_000))
}

pub fn hello(interval_ms: u64) -> Vec<u8> {
    encode(OpCode::Hello, &json!({ "heartbeat_interval": interval_ms })).unwrap()
}

pub fn frame(opcode: OpCode, data: Value) -> Vec<u8> {
    encode(opcode, &data).unwrap()
}

pub fn dispatch(seq: u64, event_type: &str, data: Value) -> Vec<u8> {
    DecodedEvent {
        opcode: OpCode::Dispatch,
        sequence: Some(seq),
        event_type: Some(event_type.to_string()),
        payload: data,
    }
    .encode()
    .unwrap()
}

pub fn ready(seq: u64, session_id: &str) -> Vec<u8> {
    dispatch(seq, "READY", json!({ "v": 6, "session_id": session_id }))
}

/// Next request written by the client, decoded.
pub async fn next_request(server: &mut MemoryServer) -> DecodedEvent {
    match server.recv().await {
        Some(OutboundFrame::Data(bytes)) => decode(&bytes).unwrap(),
        Some(OutboundFrame::Close(code)) => panic!("expected a request, client closed with {code}"),
        None => panic!("expected a request, client released the link"),
    }
}

/// Next frame written by the client, which must be a close.
pub async fn expect_close(server: &mut MemoryServer) -> u16 {
    loop {
        match server.recv().await {
            Some(OutboundFrame::Close(code)) => return code,
            Some(OutboundFrame::Data(_)) => {}
            None => panic!("link released without a close frame"),
        }
    }
}

/// Accept a connection, send HELLO and return the handshake request.
pub async fn accept_and_hello(
    listener: &mut MemoryListener,
    interval_ms: u64,
) -> (MemoryServer, DecodedEvent) {
    let mut server = listener.accept().await.expect("connection");
    assert!(server.send_frame(hello(interval_ms)).await);
    let request = next_request(&mut server).await;
    (server, request)
}

/// Wait for the first notice matching `pred`.
pub async fn wait_for<F>(events: &mut broadcast::Receiver<ShardEvent>, mut pred: F) -> ShardEvent
where
    F: FnMut(&ShardEvent) -> bool,
{
    loop {
        let event = events.recv().await.expect("shard events closed");
        if pred(&event) {
            return event;
        }
    }
}

/// Bring a shard to READY with the given session id and return its server.
pub async fn establish(shard: &mut TestShard, session_id: &str) -> MemoryServer {
    shard.handle.connect().unwrap();
    let (server, identify) = accept_and_hello(&mut shard.listener, QUIET_HEARTBEAT_MS).await;
    assert_eq!(identify.opcode, OpCode::Identify);
    assert!(server.send_frame(ready(1, session_id)).await);
    wait_for(&mut shard.events, |e| matches!(e, ShardEvent::Ready { .. })).await;
    server
}
