//! Subscriber connection behaviour against a scripted RESP server.
#![cfg(feature = "redis-store")]

use realtime_resilience::events::EventBus;
use realtime_resilience::store::{PubSubStore, RedisStore, SubscriberConnection};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

fn bulk(s: &str) -> String {
    format!("${}\r\n{}\r\n", s.len(), s)
}

fn subscribe_ack(channel: &str) -> String {
    format!("*3\r\n{}{}:1\r\n", bulk("subscribe"), bulk(channel))
}

fn message(channel: &str, payload: &str) -> String {
    format!("*3\r\n{}{}{}", bulk("message"), bulk(channel), bulk(payload))
}

fn envelope(event: &str) -> String {
    format!(r#"{{"event":"{}","data":{{}},"timestamp":1}}"#, event)
}

fn occurrences(haystack: &[u8], needle: &[u8]) -> usize {
    haystack.windows(needle.len()).filter(|w| *w == needle).count()
}

/// Answers CLIENT SETINFO with +OK and writes `script` in one piece after the
/// first SUBSCRIBE on a connection.
async fn handle(mut socket: TcpStream, script: Arc<String>) {
    let mut seen = Vec::new();
    let mut setinfo_answered = 0;
    let mut scripted = false;
    let mut buf = [0u8; 4096];
    loop {
        let n = match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        seen.extend_from_slice(&buf[..n]);
        while setinfo_answered < occurrences(&seen, b"SETINFO") {
            if socket.write_all(b"+OK\r\n").await.is_err() {
                return;
            }
            setinfo_answered += 1;
        }
        let subscribes = occurrences(&seen, b"SUBSCRIBE") - occurrences(&seen, b"UNSUBSCRIBE");
        if !scripted && subscribes > 0 {
            scripted = true;
            if socket.write_all(script.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

async fn scripted_server(script: String) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let script = Arc::new(script);
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(handle(socket, Arc::clone(&script)));
        }
    });
    format!("redis://{}/", addr)
}

#[tokio::test]
async fn test_messages_written_together_all_reach_the_bus() {
    let url = scripted_server(
        [
            subscribe_ack("c"),
            message("c", &envelope("first")),
            message("c", &envelope("second")),
        ]
        .concat(),
    )
    .await;
    let store = RedisStore::connect(&url).await.unwrap();
    let bus = EventBus::new(Arc::new(store));
    let mut stream = bus.subscribe_stream("c").await.unwrap();

    let first = timeout(Duration::from_secs(2), stream.recv()).await.unwrap().unwrap();
    let second = timeout(Duration::from_secs(2), stream.recv()).await.unwrap().unwrap();
    assert_eq!(first.event, "first");
    assert_eq!(second.event, "second");
}

#[tokio::test]
async fn test_message_before_subscribe_ack_is_kept_in_order() {
    let url = scripted_server(
        [
            message("org:events:o1", "early"),
            subscribe_ack("c"),
            message("c", "late"),
        ]
        .concat(),
    )
    .await;
    let store = RedisStore::connect(&url).await.unwrap();
    let mut conn = store.connect_subscriber().await.unwrap();
    conn.subscribe("c").await.unwrap();

    let early = timeout(Duration::from_secs(2), conn.next_message()).await.unwrap().unwrap();
    assert_eq!(early.channel, "org:events:o1");
    assert_eq!(early.payload, "early");
    let late = timeout(Duration::from_secs(2), conn.next_message()).await.unwrap().unwrap();
    assert_eq!(late.channel, "c");
    assert_eq!(late.payload, "late");
}

#[tokio::test]
async fn test_cancelled_reads_lose_nothing() {
    let url = scripted_server(
        [
            subscribe_ack("c"),
            message("c", "one"),
            message("c", "two"),
            message("c", "three"),
        ]
        .concat(),
    )
    .await;
    let store = RedisStore::connect(&url).await.unwrap();
    let mut conn = store.connect_subscriber().await.unwrap();
    conn.subscribe("c").await.unwrap();

    let mut got = Vec::new();
    while got.len() < 3 {
        // short deadlines drop the read future repeatedly
        match timeout(Duration::from_micros(50), conn.next_message()).await {
            Ok(Some(msg)) => got.push(msg.payload),
            Ok(None) => panic!("connection closed after {:?}", got),
            Err(_) => {}
        }
    }
    assert_eq!(got, vec!["one", "two", "three"]);
}
