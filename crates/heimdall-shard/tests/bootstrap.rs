//! Bootstrap fetch against a one-shot local HTTP responder.

use heimdall_shard::{IdentifyBudget, ShardError, fetch_gateway};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Serve one response and hand back the raw request head.
async fn respond_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}/api/v6", listener.local_addr().unwrap());

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }

        let response = format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        let _ = stream.shutdown().await;
        String::from_utf8(request).unwrap()
    });

    (base, server)
}

#[tokio::test]
async fn fetch_parses_gateway_info() {
    let (base, server) = respond_once(
        "200 OK",
        r#"{"url":"wss://gateway.discord.gg","shards":2,"session_start_limit":{"total":1000,"remaining":998,"reset_after":3600000,"max_concurrency":1}}"#,
    )
    .await;

    let info = fetch_gateway(&format!("{base}/"), "secret").await.unwrap();
    assert_eq!(info.url, "wss://gateway.discord.gg");
    assert_eq!(info.shards, 2);
    assert_eq!(
        info.session_start_limit.budget(),
        IdentifyBudget {
            total: 1000,
            remaining: 998,
            reset_after: Duration::from_secs(3600),
        }
    );

    let request = server.await.unwrap().to_lowercase();
    assert!(request.starts_with("get /api/v6/gateway/bot http/1.1"));
    assert!(request.contains("authorization: bot secret"));
}

#[tokio::test]
async fn non_success_status_is_an_error() {
    let (base, server) = respond_once("401 Unauthorized", r#"{"message":"401: Unauthorized"}"#).await;

    let err = fetch_gateway(&base, "bad").await.unwrap_err();
    match err {
        ShardError::Bootstrap(msg) => {
            assert!(msg.starts_with("HTTP 401"));
            assert!(msg.contains("Unauthorized"));
        }
        other => panic!("unexpected error: {other}"),
    }
    server.await.unwrap();
}

#[tokio::test]
async fn zero_shards_is_an_error() {
    let (base, server) = respond_once(
        "200 OK",
        r#"{"url":"wss://gateway.discord.gg","shards":0,"session_start_limit":{"total":1000,"remaining":1000,"reset_after":0}}"#,
    )
    .await;

    let err = fetch_gateway(&base, "secret").await.unwrap_err();
    assert!(matches!(err, ShardError::Bootstrap(msg) if msg.contains("zero shards")));
    server.await.unwrap();
}

#[tokio::test]
async fn malformed_body_is_an_error() {
    let (base, server) = respond_once("200 OK", "not json").await;

    let err = fetch_gateway(&base, "secret").await.unwrap_err();
    assert!(matches!(err, ShardError::Bootstrap(msg) if msg.starts_with("invalid response")));
    server.await.unwrap();
}
