//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use api_gateway::config::{parse_config, GatewayConfig};
use api_gateway::supervisor::{PoolSnapshot, SupervisorHandle};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// A mock upstream that answers every request with `<name> <METHOD> <target>`.
pub struct MockBackend {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl MockBackend {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Start a mock backend on an ephemeral port.
pub async fn start_mock_backend(name: &'static str) -> MockBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let counter = counter.clone();
            tokio::spawn(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                answer(socket, name).await;
            });
        }
    });

    MockBackend { addr, hits }
}

async fn answer(mut socket: TcpStream, name: &str) {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    let head = String::from_utf8_lossy(&head);
    let request_line = head.lines().next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let body = format!(
        "{} {} {}",
        name,
        parts.next().unwrap_or_default(),
        parts.next().unwrap_or_default()
    );

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}

/// A port nothing listens on right now.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Gateway config on `127.0.0.1:<port>` with the given JSON sections merged in.
pub fn gateway_config(port: u16, sections: Value) -> GatewayConfig {
    let mut root = serde_json::json!({
        "host": "127.0.0.1",
        "ports": {"http": port},
        "logLevel": "debug",
    });
    if let (Some(root), Some(sections)) = (root.as_object_mut(), sections.as_object()) {
        for (key, value) in sections {
            root.insert(key.clone(), value.clone());
        }
    }
    parse_config(&root.to_string()).unwrap()
}

/// Single proxy workflow for GET requests, forwarding to `target`.
pub fn proxy_config(port: u16, target: &str) -> GatewayConfig {
    gateway_config(
        port,
        serde_json::json!({
            "filters": {"gets": {"methods": ["GET"]}},
            "workflows": {
                "api": {
                    "filters": ["gets"],
                    "proxies": [{"require": "api-proxy", "target": target, "timeoutSecs": 5}]
                }
            }
        }),
    )
}

/// Poll the supervisor snapshot until `condition` holds.
pub async fn wait_for_pool(
    handle: &SupervisorHandle,
    condition: impl Fn(&PoolSnapshot) -> bool,
) -> Arc<PoolSnapshot> {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let snapshot = handle.snapshot();
            if condition(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("worker pool never reached the expected state")
}
