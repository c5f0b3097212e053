use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use telesync_core::{EventEnvelope, Scope, StreamType};
use telesync_queue::{
    ConsentClient, DeliveryCourier, DeliveryError, DurableQueueStore, HttpSink, SqliteQueueStore,
    endpoint,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Accept one request, answer with `status_line`, return the raw request.
async fn serve_once(status_line: &'static str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_request(&mut socket).await;
        let response =
            format!("HTTP/1.1 {status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
        socket.write_all(response.as_bytes()).await.unwrap();
        let _ = socket.shutdown().await;
        request
    });
    (format!("http://{addr}"), handle)
}

async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let body_len = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + body_len {
                break;
            }
        }
    }
    String::from_utf8(buf).unwrap()
}

fn envelope(id: &str) -> EventEnvelope {
    let mut env = EventEnvelope::new(
        "participant-9",
        "phone",
        StreamType::Text,
        Utc::now(),
        serde_json::json!({ "text": "hello" }),
    );
    env.event_id = id.into();
    env
}

#[tokio::test]
async fn batch_is_posted_as_events_object_with_api_key() {
    let (base, server) = serve_once("200 OK").await;
    let store: Arc<dyn DurableQueueStore> = Arc::new(SqliteQueueStore::open_in_memory().unwrap());
    let sink = HttpSink::new(reqwest::Client::new(), endpoint(&base, "/streams/events"))
        .with_api_key(Some("secret".into()));
    let courier = DeliveryCourier::new(store.clone(), sink, Duration::from_secs(5));
    courier.enqueue(&envelope("e-1"), 0).unwrap();
    courier.enqueue(&envelope("e-2"), 0).unwrap();

    let outcome = courier.flush(10).await.unwrap();
    assert_eq!(outcome.sent, 2);
    assert!(store.is_empty().unwrap());

    let request = server.await.unwrap();
    assert!(request.starts_with("POST /streams/events HTTP/1.1"));
    assert!(request.to_ascii_lowercase().contains("x-api-key: secret"));
    let body = &request[request.find("\r\n\r\n").unwrap() + 4..];
    let json: serde_json::Value = serde_json::from_str(body).unwrap();
    let ids: Vec<&str> = json["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["event_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["e-1", "e-2"]);
}

#[tokio::test]
async fn server_error_keeps_records() {
    let (base, server) = serve_once("503 Service Unavailable").await;
    let store: Arc<dyn DurableQueueStore> = Arc::new(SqliteQueueStore::open_in_memory().unwrap());
    let sink = HttpSink::new(reqwest::Client::new(), endpoint(&base, "/streams/events"));
    let courier = DeliveryCourier::new(store.clone(), sink, Duration::from_secs(5));
    courier.enqueue(&envelope("e-1"), 0).unwrap();

    let err = courier.flush(10).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Rejected { status: 503, retryable: true }));
    assert_eq!(store.len().unwrap(), 1);
    server.await.unwrap();
}

#[tokio::test]
async fn unreachable_host_is_transport_error() {
    // Bind then drop to get a port nothing listens on.
    let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
    let store: Arc<dyn DurableQueueStore> = Arc::new(SqliteQueueStore::open_in_memory().unwrap());
    let sink = HttpSink::new(reqwest::Client::new(), format!("http://{addr}/streams/events"));
    let courier = DeliveryCourier::new(store.clone(), sink, Duration::from_secs(5));
    courier.enqueue(&envelope("e-1"), 0).unwrap();

    let err = courier.flush(10).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Transport(_)));
    assert_eq!(store.len().unwrap(), 1);
}

#[tokio::test]
async fn consent_posts_participant_and_scopes() {
    let (base, server) = serve_once("200 OK").await;
    let client = ConsentClient::new(reqwest::Client::new(), endpoint(&base, "/consent/participant"));
    client
        .grant("participant-9", &[Scope::Wearables, Scope::Text])
        .await
        .unwrap();

    let request = server.await.unwrap();
    assert!(request.starts_with("POST /consent/participant HTTP/1.1"));
    let body = &request[request.find("\r\n\r\n").unwrap() + 4..];
    let json: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(
        json,
        serde_json::json!({ "participant_id": "participant-9", "scopes": ["wearables", "text"] })
    );
}
