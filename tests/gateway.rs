//! End-to-end tests through the gateway's HTTP front end and status API

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use poolmux::admin::AdminServer;
use poolmux::config::{ControllerConfig, SpawnerConfig};
use poolmux::controller::Controller;
use poolmux::proxy::{FrontendConfig, ProxyServer};
use poolmux::spawner::Spawner;
use poolmux::store::MemoryStore;
use poolmux::tables::{Endpoint, PoolRecord, ProcessRecord, Tables};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Pick a port that is free right now
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Wait for a port to become available (server listening)
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port)).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Minimal backend that records request heads and answers 200
async fn fake_backend() -> (u16, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                log.lock().push(String::from_utf8_lossy(&buf).to_lowercase());
                let body = "backend says hello";
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    (port, seen)
}

async fn http_get(port: u16, path: &str, extra_headers: &str) -> String {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\n{}Connection: close\r\n\r\n",
        path, extra_headers
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

struct Gateway {
    port: u16,
    tables: Arc<Tables>,
    shutdown_tx: watch::Sender<bool>,
}

async fn start_gateway() -> Gateway {
    let tables = Arc::new(Tables::new(Arc::new(MemoryStore::new())));
    tables
        .insert_pool(&PoolRecord {
            pool_id: "P1".to_string(),
            owner: "alice".to_string(),
            buckets_directory: "/srv/pools/P1".to_string(),
            access_keys: vec!["AKIDP1".to_string()],
            direct_hostnames: vec!["p1.example.com".to_string()],
        })
        .unwrap();

    let port = free_port();
    let node = Endpoint::new("127.0.0.1", port);
    let spawner = Spawner::new(node.clone(), &SpawnerConfig::default(), "/nonexistent/poolmux.toml");
    let controller = Arc::new(Controller::new(
        Arc::clone(&tables),
        spawner,
        node,
        &ControllerConfig::default(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let proxy = ProxyServer::new(
        format!("127.0.0.1:{}", port).parse().unwrap(),
        controller,
        FrontendConfig {
            facade_hostname: Some("s3.example.com".to_string()),
            forwarding_timeout: Duration::from_secs(5),
            trusted_proxies: Vec::new(),
        },
        shutdown_rx,
    );
    tokio::spawn(async move {
        let _ = proxy.run().await;
    });
    assert!(wait_for_port(port, Duration::from_secs(5)).await);

    Gateway {
        port,
        tables,
        shutdown_tx,
    }
}

fn record_backend(tables: &Tables, gateway_port: u16, backend_port: u16) {
    tables
        .set_process(
            "P1",
            &ProcessRecord {
                mux_host: "127.0.0.1".to_string(),
                mux_port: gateway_port,
                backend_host: "127.0.0.1".to_string(),
                backend_port,
                manager_pid: 1,
                backend_pid: None,
                started_at: 0,
            },
            Duration::from_secs(60),
        )
        .unwrap();
}

#[tokio::test]
async fn test_forwards_to_local_backend() {
    let gateway = start_gateway().await;
    let (backend_port, seen) = fake_backend().await;
    record_backend(&gateway.tables, gateway.port, backend_port);

    let response = http_get(
        gateway.port,
        "/bucket/object?versionId=7",
        "Host: p1.example.com\r\nX-Trace-Id: trace-42\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.ends_with("backend says hello"));

    let requests = seen.lock().clone();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].starts_with("get /bucket/object?versionid=7 http/1.1"));
    assert!(requests[0].contains("x-trace-id: trace-42"));
    assert!(requests[0].contains("x-forwarded-host: p1.example.com"));
    assert!(!requests[0].contains("x-poolmux-forwarded"));

    assert!(gateway.tables.get_access_time("P1").unwrap().is_some());
    let _ = gateway.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_forwarded_marker_from_untrusted_peer_is_ignored() {
    let gateway = start_gateway().await;
    let (backend_port, seen) = fake_backend().await;
    record_backend(&gateway.tables, gateway.port, backend_port);

    let response = http_get(
        gateway.port,
        "/bucket",
        "Host: p1.example.com\r\nX-Poolmux-Forwarded: 1\r\nX-Forwarded-For: 203.0.113.9\r\nX-Forwarded-Host: victim.example.com\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);

    let requests = seen.lock().clone();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].contains("x-forwarded-for: 127.0.0.1"));
    assert!(requests[0].contains("x-forwarded-host: p1.example.com"));
    assert!(!requests[0].contains("203.0.113.9"));
    assert!(!requests[0].contains("victim.example.com"));
    assert!(!requests[0].contains("x-poolmux-forwarded"));
    let _ = gateway.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_facade_routes_by_access_key() {
    let gateway = start_gateway().await;
    let (backend_port, seen) = fake_backend().await;
    record_backend(&gateway.tables, gateway.port, backend_port);

    let response = http_get(
        gateway.port,
        "/bucket",
        "Host: s3.example.com\r\nAuthorization: AWS4-HMAC-SHA256 Credential=AKIDP1/20240101/us-east-1/s3/aws4_request, SignedHeaders=host, Signature=abc\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert_eq!(seen.lock().len(), 1);
    let _ = gateway.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_unknown_host_is_404() {
    let gateway = start_gateway().await;

    let response = http_get(gateway.port, "/", "Host: nobody.example.com\r\n").await;
    assert!(response.starts_with("HTTP/1.1 404"), "got: {}", response);
    assert!(response.to_lowercase().contains("x-poolmux-error: unknown_pool"));
    let _ = gateway.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_backend_down_is_502() {
    let gateway = start_gateway().await;
    record_backend(&gateway.tables, gateway.port, free_port());

    let response = http_get(gateway.port, "/", "Host: p1.example.com\r\n").await;
    assert!(response.starts_with("HTTP/1.1 502"), "got: {}", response);
    let _ = gateway.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_status_api() {
    let tables = Arc::new(Tables::new(Arc::new(MemoryStore::new())));
    record_backend(&tables, 8008, 9001);

    let port = free_port();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let admin = AdminServer::new(
        format!("127.0.0.1:{}", port).parse().unwrap(),
        Arc::clone(&tables),
        Endpoint::new("127.0.0.1", 8008),
        shutdown_rx,
        "secret".to_string(),
    );
    tokio::spawn(async move {
        let _ = admin.run().await;
    });
    assert!(wait_for_port(port, Duration::from_secs(5)).await);

    let health = http_get(port, "/health", "Host: localhost\r\n").await;
    assert!(health.starts_with("HTTP/1.1 200"));

    let unauthorized = http_get(port, "/processes", "Host: localhost\r\n").await;
    assert!(unauthorized.starts_with("HTTP/1.1 401"));

    let processes = http_get(
        port,
        "/processes",
        "Host: localhost\r\nAuthorization: Bearer secret\r\n",
    )
    .await;
    assert!(processes.starts_with("HTTP/1.1 200"));
    assert!(processes.contains("\"pool_id\":\"P1\""));
    assert!(processes.contains("127.0.0.1:9001"));

    let _ = shutdown_tx.send(true);
}
