//! Local status HTTP server.
//!
//! Provides:
//! - `GET /health`   — always `{"status":"ok"}` (process is running)
//! - `GET /metrics`  — counter snapshot JSON
//!
//! # Security
//! No authentication. Read-only.

use crate::metrics::BridgeMetrics;
use crate::storage::pending::PendingStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::info;

/// Handle to the running status HTTP server.
pub struct StatusServer {
    local_addr: SocketAddr,
}

impl StatusServer {
    /// Return the bound listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bind and start serving in a background task.
    pub async fn start(
        bind: &str,
        metrics: Arc<BridgeMetrics>,
        store: Arc<PendingStore>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<StatusServer, std::io::Error> {
        let listener = TcpListener::bind(bind).await?;
        let local_addr = listener.local_addr()?;

        tokio::spawn(async move {
            run_server(listener, metrics, store, shutdown).await;
        });

        Ok(StatusServer { local_addr })
    }
}

// ---------------------------------------------------------------------------
// Server accept loop
// ---------------------------------------------------------------------------

async fn run_server(
    listener: TcpListener,
    metrics: Arc<BridgeMetrics>,
    store: Arc<PendingStore>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let metrics = metrics.clone();
                    let store = store.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, metrics, store).await;
                    });
                }
                Err(_) => break,
            },
        }
    }
    info!("status HTTP server stopped");
}

// ---------------------------------------------------------------------------
// Request handler
// ---------------------------------------------------------------------------

async fn handle_connection(
    mut stream: TcpStream,
    metrics: Arc<BridgeMetrics>,
    store: Arc<PendingStore>,
) {
    // 4 KiB is plenty for a request line + headers on this surface.
    let mut buf = vec![0u8; 4096];
    let n = match stream.read(&mut buf).await {
        Ok(n) if n > 0 => n,
        _ => return,
    };

    let request = match std::str::from_utf8(&buf[..n]) {
        Ok(s) => s,
        Err(_) => {
            send_response(&mut stream, 400, "text/plain", "Bad Request").await;
            return;
        }
    };

    let first_line = request.lines().next().unwrap_or("");
    let mut parts = first_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("/");

    match (method, path) {
        ("GET", "/health") => {
            send_response(&mut stream, 200, "application/json", "{\"status\":\"ok\"}").await;
        }
        ("GET", "/metrics") => {
            let snapshot = metrics.snapshot(store.pending_count().await);
            send_response(&mut stream, 200, "application/json", &snapshot.to_string()).await;
        }
        _ => {
            send_response(&mut stream, 404, "text/plain", "Not Found").await;
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP response helper
// ---------------------------------------------------------------------------

async fn send_response(stream: &mut TcpStream, status: u16, content_type: &str, body: &str) {
    let status_text = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Unknown",
    };

    let response = format!(
        "HTTP/1.1 {status} {status_text}\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {len}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        len = body.len(),
    );

    let _ = stream.write_all(response.as_bytes()).await;
}
