use std::net::SocketAddr;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use weatherhub::client::{station, Client};
use weatherhub::config::Config;
use weatherhub::server::Server;

fn config(dir: &TempDir) -> Config {
    let mut cfg = Config::default();
    cfg.listen.host = "127.0.0.1".to_string();
    cfg.listen.port = 0;
    cfg.storage.path = dir.path().join("weather_data.json");
    cfg.storage.fsync = false;
    cfg
}

async fn start(cfg: Config) -> (Server, SocketAddr) {
    let mut server = Server::new(cfg).expect("server");
    let addr = server.start().await.expect("start");
    (server, addr)
}

/// Send raw bytes and collect everything the server writes back.
async fn raw(addr: SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(request).await.expect("write");
    let mut out = String::new();
    stream.read_to_string(&mut out).await.expect("read");
    out
}

fn put_request(body: &str) -> Vec<u8> {
    format!(
        "PUT /weather.json HTTP/1.1\r\nUser-Agent: test/1.0\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

fn status_line(reply: &str) -> &str {
    reply.lines().next().unwrap_or_default()
}

fn body_json(reply: &str) -> Value {
    let (_, body) = reply.split_once("\r\n\r\n").expect("header terminator");
    serde_json::from_str(body).expect("json body")
}

fn header<'a>(reply: &'a str, name: &str) -> Option<&'a str> {
    let (head, _) = reply.split_once("\r\n\r\n")?;
    head.lines()
        .skip(1)
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim())
}

#[tokio::test]
async fn test_first_put_creates_and_get_returns_it() {
    let dir = TempDir::new().expect("tempdir");
    let (mut server, addr) = start(config(&dir)).await;

    let reply = raw(addr, &put_request(r#"{"id":"S1","temp":25}"#)).await;
    assert_eq!(status_line(&reply), "HTTP/1.1 201 Created");

    let reply = raw(addr, b"GET /weather.json HTTP/1.1\r\n\r\n").await;
    assert_eq!(status_line(&reply), "HTTP/1.1 200 OK");
    assert_eq!(header(&reply, "Content-Type"), Some("application/json"));
    assert_eq!(body_json(&reply), json!({"S1": {"id": "S1", "temp": 25}}));

    server.stop().await.expect("stop");
}

#[tokio::test]
async fn test_repeat_put_replaces_payload() {
    let dir = TempDir::new().expect("tempdir");
    let (mut server, addr) = start(config(&dir)).await;

    raw(addr, &put_request(r#"{"id":"S1","temp":25}"#)).await;
    let reply = raw(addr, &put_request(r#"{"id":"S1","temp":30}"#)).await;
    assert_eq!(status_line(&reply), "HTTP/1.1 200 OK");

    let reply = raw(addr, b"GET /weather.json HTTP/1.1\r\n\r\n").await;
    assert_eq!(body_json(&reply), json!({"S1": {"id": "S1", "temp": 30}}));

    server.stop().await.expect("stop");
}

#[tokio::test]
async fn test_bad_puts_are_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let (mut server, addr) = start(config(&dir)).await;

    let reply = raw(
        addr,
        b"PUT /weather.json HTTP/1.1\r\nContent-Length: 0\r\n\r\n",
    )
    .await;
    assert_eq!(status_line(&reply), "HTTP/1.1 400 Bad Request");

    let reply = raw(addr, &put_request(r#"{"temp":5}"#)).await;
    assert_eq!(status_line(&reply), "HTTP/1.1 400 Bad Request");

    let reply = raw(addr, b"PUT /weather.json HTTP/1.1\r\n\r\n").await;
    assert_eq!(status_line(&reply), "HTTP/1.1 411 Length Required");

    let reply = raw(addr, b"DELETE /weather.json HTTP/1.1\r\n\r\n").await;
    assert_eq!(status_line(&reply), "HTTP/1.1 400 Bad Request");

    let reply = raw(addr, b"GET /weather.json HTTP/1.1\r\n\r\n").await;
    assert_eq!(body_json(&reply), json!({}));

    server.stop().await.expect("stop");
}

#[tokio::test]
async fn test_concurrent_producers_both_land() {
    let dir = TempDir::new().expect("tempdir");
    let (mut server, addr) = start(config(&dir)).await;

    let a = tokio::spawn(async move { raw(addr, &put_request(r#"{"id":"S1","temp":1}"#)).await });
    let b = tokio::spawn(async move { raw(addr, &put_request(r#"{"id":"S2","temp":2}"#)).await });

    for reply in [a.await.expect("join"), b.await.expect("join")] {
        assert_eq!(status_line(&reply), "HTTP/1.1 201 Created");
    }

    let reply = raw(addr, b"GET /weather.json HTTP/1.1\r\n\r\n").await;
    let body = body_json(&reply);
    assert!(body.get("S1").is_some());
    assert!(body.get("S2").is_some());

    server.stop().await.expect("stop");
}

#[tokio::test]
async fn test_response_clock_exceeds_request_clock() {
    let dir = TempDir::new().expect("tempdir");
    let (mut server, addr) = start(config(&dir)).await;

    let reply = raw(
        addr,
        b"GET /weather.json HTTP/1.1\r\nLamport-Clock: 500\r\n\r\n",
    )
    .await;
    let clock: u64 = header(&reply, "Lamport-Clock")
        .expect("clock header")
        .parse()
        .expect("numeric clock");
    assert!(clock > 500, "clock {clock}");

    // A later request without a stamp still sees a larger value.
    let reply = raw(addr, b"GET /weather.json HTTP/1.1\r\n\r\n").await;
    let later: u64 = header(&reply, "Lamport-Clock")
        .expect("clock header")
        .parse()
        .expect("numeric clock");
    assert!(later > clock);

    server.stop().await.expect("stop");
}

#[tokio::test]
async fn test_client_put_and_get() {
    let dir = TempDir::new().expect("tempdir");
    let (mut server, addr) = start(config(&dir)).await;

    let payload = station::parse("id: IDS60901\nair_temp: 13.3\nwind_dir: S\n").expect("station");
    let client = Client::new(addr.to_string());

    assert_eq!(client.put(&payload).await.expect("put"), 201);
    assert_eq!(client.put(&payload).await.expect("put"), 200);

    let snapshot = client.get().await.expect("get");
    assert_eq!(snapshot["IDS60901"].get("air_temp"), Some(&json!("13.3")));

    // Each exchange ticks once to send and observes once on reply.
    assert!(client.clock().read() >= 6);

    server.stop().await.expect("stop");
}

#[tokio::test]
async fn test_snapshot_survives_restart() {
    let dir = TempDir::new().expect("tempdir");

    let (mut server, addr) = start(config(&dir)).await;
    raw(addr, &put_request(r#"{"id":"S1","temp":25}"#)).await;
    raw(addr, &put_request(r#"{"id":"S2","temp":26}"#)).await;
    server.stop().await.expect("stop");

    let on_disk: Value = serde_json::from_slice(
        &std::fs::read(dir.path().join("weather_data.json")).expect("snapshot file"),
    )
    .expect("snapshot json");
    assert_eq!(on_disk["S2"]["temp"], json!(26));

    let (mut server, addr) = start(config(&dir)).await;
    let reply = raw(addr, b"GET /weather.json HTTP/1.1\r\n\r\n").await;
    assert_eq!(
        body_json(&reply),
        json!({"S1": {"id": "S1", "temp": 25}, "S2": {"id": "S2", "temp": 26}})
    );
    server.stop().await.expect("stop");
}

#[tokio::test]
async fn test_silent_producer_is_evicted() {
    let dir = TempDir::new().expect("tempdir");
    let mut cfg = config(&dir);
    cfg.expiry.ttl = Duration::from_millis(150);
    cfg.expiry.sweep_interval = Duration::from_millis(25);
    let (mut server, addr) = start(cfg).await;

    raw(addr, &put_request(r#"{"id":"S1","temp":25}"#)).await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    let reply = raw(addr, b"GET /weather.json HTTP/1.1\r\n\r\n").await;
    assert_eq!(body_json(&reply), json!({}));

    let on_disk: Value = serde_json::from_slice(
        &std::fs::read(dir.path().join("weather_data.json")).expect("snapshot file"),
    )
    .expect("snapshot json");
    assert_eq!(on_disk, json!({}));

    server.stop().await.expect("stop");
}
