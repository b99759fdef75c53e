//! ISUP v5 TCP listener.
//!
//! One task per accepted connection.  Each connection loops through
//! READ_HEADER -> READ_BODY -> DISPATCH_AND_ACK; any framing error or
//! idle timeout closes it.  The dispatch hand-off is a channel send, so
//! the ACK goes out without waiting on upstream delivery -- durability is
//! the pending store's job, not the read loop's.

use crate::metrics::BridgeMetrics;
use crate::normalize::normalize_isup;
use acs_protocol::NormalizedEvent;
use isup_core::{
    CrcMode, HEADER_SIZE, make_ack, make_heartbeat_ack, parse_access_event, parse_frame,
    parse_header,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct IsupSettings {
    /// Frames with `28 + data_length` above this close the connection.
    pub max_frame_len: usize,
    /// Connection closes after this long without a complete read.
    pub idle_timeout: Duration,
    pub crc_mode: CrcMode,
}

impl IsupSettings {
    pub fn from_config(cfg: &crate::config::ServerConfig) -> IsupSettings {
        IsupSettings {
            max_frame_len: cfg.max_frame_len,
            idle_timeout: Duration::from_secs(cfg.idle_timeout_secs),
            crc_mode: if cfg.strict_crc { CrcMode::Strict } else { CrcMode::Tolerant },
        }
    }
}

// ---------------------------------------------------------------------------
// Accept loop
// ---------------------------------------------------------------------------

/// Run the listener until shutdown.  The caller binds so tests can use
/// port 0 and read the bound address back.
pub async fn run(
    listener: TcpListener,
    settings: IsupSettings,
    tx: mpsc::Sender<NormalizedEvent>,
    metrics: Arc<BridgeMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    BridgeMetrics::incr(&metrics.connections_total);
                    info!(%peer, "new ISUP connection");
                    let settings = settings.clone();
                    let tx = tx.clone();
                    let metrics = metrics.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, peer, settings, tx, metrics, shutdown).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "ISUP accept failed");
                }
            },
        }
    }
    info!("ISUP listener stopped");
}

// ---------------------------------------------------------------------------
// Per-connection state machine
// ---------------------------------------------------------------------------

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    settings: IsupSettings,
    tx: mpsc::Sender<NormalizedEvent>,
    metrics: Arc<BridgeMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let client_addr = peer.to_string();
    let mut header = [0u8; HEADER_SIZE];

    loop {
        // READ_HEADER
        let read = tokio::select! {
            _ = shutdown.changed() => break,
            r = tokio::time::timeout(settings.idle_timeout, stream.read_exact(&mut header)) => r,
        };
        match read {
            Err(_) => {
                info!(peer = %client_addr, "ISUP connection idle, closing");
                break;
            }
            Ok(Err(_)) => {
                info!(peer = %client_addr, "ISUP connection closed by peer");
                break;
            }
            Ok(Ok(_)) => {}
        }

        let hdr = match parse_header(&header) {
            Ok(h) => h,
            Err(e) => {
                warn!(peer = %client_addr, error = %e, "invalid ISUP header, closing");
                BridgeMetrics::incr(&metrics.events_failed);
                break;
            }
        };
        if HEADER_SIZE + hdr.data_length as usize > settings.max_frame_len {
            warn!(
                peer = %client_addr,
                data_length = hdr.data_length,
                "ISUP frame exceeds max length, closing"
            );
            BridgeMetrics::incr(&metrics.events_failed);
            break;
        }

        // READ_BODY
        let mut packet = Vec::with_capacity(HEADER_SIZE + hdr.data_length as usize);
        packet.extend_from_slice(&header);
        if hdr.data_length > 0 {
            let mut body = vec![0u8; hdr.data_length as usize];
            let read = tokio::time::timeout(settings.idle_timeout, stream.read_exact(&mut body)).await;
            match read {
                Err(_) | Ok(Err(_)) => {
                    info!(peer = %client_addr, "ISUP connection lost mid-frame");
                    break;
                }
                Ok(Ok(_)) => {}
            }
            packet.extend_from_slice(&body);
        }

        let frame = match parse_frame(&packet, settings.crc_mode) {
            Ok(f) => f,
            Err(e) => {
                warn!(peer = %client_addr, error = %e, "ISUP frame rejected, closing");
                BridgeMetrics::incr(&metrics.events_failed);
                break;
            }
        };
        if !frame.crc_valid {
            warn!(peer = %client_addr, seq = hdr.sequence, "ISUP CRC mismatch tolerated");
        }

        // DISPATCH_AND_ACK
        let ack = if hdr.data_length == 0 {
            debug!(peer = %client_addr, device_id = %hdr.device_id, "ISUP heartbeat");
            make_heartbeat_ack()
        } else {
            BridgeMetrics::incr(&metrics.events_received);
            match parse_access_event(&frame.body) {
                Some(access) => {
                    BridgeMetrics::incr(&metrics.events_parsed);
                    let event = normalize_isup(&frame, &access, &packet, &client_addr);
                    if tx.send(event).await.is_err() {
                        warn!(peer = %client_addr, "dispatch channel closed, dropping event");
                    }
                }
                None => {
                    debug!(
                        peer = %client_addr,
                        command = hdr.command,
                        len = hdr.data_length,
                        "ISUP frame without decodable access event"
                    );
                }
            }
            make_ack(hdr.sequence)
        };

        if let Err(e) = stream.write_all(&ack).await {
            warn!(peer = %client_addr, error = %e, "failed to write ISUP ACK");
            break;
        }
    }
}
