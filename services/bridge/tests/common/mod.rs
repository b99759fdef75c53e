//! Shared in-process harness for bridge integration tests.
//!
//! Provides a scripted mock upstream (answers each connection with the
//! next status in its list, repeating the last) and a ready-made
//! `DispatchContext` bound to a single tenant.

use bridge::config::{BridgeConfig, load_config_from_str};
use bridge::dispatch::Dispatcher;
use bridge::metrics::BridgeMetrics;
use bridge::pipeline::DispatchContext;
use bridge::storage::pending::PendingStore;
use bridge::tenants::TenantDirectory;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Start a mock upstream endpoint.  Returns its URL and a channel of the
/// JSON bodies it received.
pub async fn start_mock_upstream(
    statuses: Vec<u16>,
) -> (String, mpsc::UnboundedReceiver<serde_json::Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut served = 0usize;
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            let status = statuses
                .get(served)
                .or(statuses.last())
                .copied()
                .unwrap_or(200);
            served += 1;

            let body = read_request_body(&mut sock).await;
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(&body) {
                let _ = tx.send(json);
            }
            let response = format!(
                "HTTP/1.1 {} MOCK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
                status
            );
            let _ = sock.write_all(response.as_bytes()).await;
        }
    });

    (format!("http://{}/event", addr), rx)
}

async fn read_request_body(sock: &mut tokio::net::TcpStream) -> String {
    let mut data = Vec::new();
    let mut buf = [0u8; 2048];
    loop {
        if let Some(split) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            let headers = String::from_utf8_lossy(&data[..split]).to_lowercase();
            let content_length: usize = headers
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0);
            let body_start = split + 4;
            while data.len() < body_start + content_length {
                let n = sock.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                data.extend_from_slice(&buf[..n]);
            }
            return String::from_utf8_lossy(&data[body_start..]).into_owned();
        }
        let n = sock.read(&mut buf).await.unwrap_or(0);
        if n == 0 {
            return String::new();
        }
        data.extend_from_slice(&buf[..n]);
    }
}

/// Config with one tenant ("acme") bound to the ISUP terminal identity
/// and a camera MAC.
pub fn test_config(upstream_url: &str, storage_path: &Path) -> BridgeConfig {
    load_config_from_str(&format!(
        r#"
server:
  storage_path: {storage}
tenants:
  acme:
    upstream_url: {url}
    auth: {{ type: bearer, token: test-token }}
objects:
  - terminals:
      - ip: 127.0.0.1
        mac: "TERM000000000001"
        tenant: acme
      - ip: 127.0.0.1
        mac: "AA:BB:CC:DD:EE:01"
        tenant: acme
"#,
        storage = storage_path.display(),
        url = upstream_url,
    ))
    .unwrap()
}

/// Dispatch context over the test config with a fast retry policy.
pub fn test_context(cfg: &BridgeConfig) -> DispatchContext {
    DispatchContext {
        tenants: Arc::new(TenantDirectory::from_config(cfg)),
        dispatcher: Arc::new(
            Dispatcher::with_policy(
                Duration::from_secs(2),
                3,
                Duration::from_millis(10),
                Duration::from_millis(40),
            )
            .unwrap(),
        ),
        store: Arc::new(
            PendingStore::open(&cfg.server.storage_path, cfg.server.max_pending_days).unwrap(),
        ),
        metrics: Arc::new(BridgeMetrics::new()),
    }
}
