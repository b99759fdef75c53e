//! Persistent alertStream consumer.
//!
//! One client per device in `alert_stream` mode.  The device holds the
//! HTTP response open and emits boundary-delimited XML/JPEG parts; the
//! client authenticates with Digest after the initial 401, splits the
//! streamed body incrementally, and feeds every XML part through the
//! normalizer into the pipeline.
//!
//! Liveness is heartbeat-based: if no bytes arrive within the heartbeat
//! timeout the connection is torn down and re-established after the
//! reconnect delay.  `stop` (the shutdown watch) exits the loop cleanly.

use crate::metrics::BridgeMetrics;
use crate::normalize::{IsapiRules, normalize_isapi};
use acs_protocol::{EventSource, NormalizedEvent};
use futures_util::StreamExt;
use isapi_core::{DigestState, PartKind, StreamSplitter, boundary_from_content_type, parse_alerts};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const ALERT_STREAM_PATH: &str = "/ISAPI/Event/notification/alertStream";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
enum StreamError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("digest auth failed after retry (HTTP 401)")]
    AuthFailed,
    #[error("unexpected status {0}")]
    BadStatus(u16),
    #[error("no heartbeat for {0:?}, reconnecting")]
    HeartbeatTimeout(Duration),
    #[error("stream ended")]
    Ended,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct AlertStreamClient {
    ip: String,
    username: String,
    password: String,
    reconnect_delay: Duration,
    heartbeat_timeout: Duration,
    rules: IsapiRules,
    allowed_device_ids: Arc<HashSet<String>>,
    tx: mpsc::Sender<NormalizedEvent>,
    metrics: Arc<BridgeMetrics>,
}

impl AlertStreamClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ip: &str,
        username: &str,
        password: &str,
        reconnect_delay: Duration,
        heartbeat_timeout: Duration,
        rules: IsapiRules,
        allowed_device_ids: Arc<HashSet<String>>,
        tx: mpsc::Sender<NormalizedEvent>,
        metrics: Arc<BridgeMetrics>,
    ) -> AlertStreamClient {
        AlertStreamClient {
            ip: ip.to_owned(),
            username: username.to_owned(),
            password: password.to_owned(),
            reconnect_delay,
            heartbeat_timeout,
            rules,
            allowed_device_ids,
            tx,
            metrics,
        }
    }

    /// Run the connect/stream/reconnect loop until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let client = match reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                warn!(device = %self.ip, error = %e, "failed to build alertStream HTTP client");
                return;
            }
        };

        loop {
            let mut digest = DigestState::new(&self.username, &self.password);
            tokio::select! {
                _ = shutdown.changed() => break,
                result = self.connect_and_stream(&client, &mut digest) => {
                    match result {
                        Err(StreamError::HeartbeatTimeout(t)) => {
                            warn!(device = %self.ip, timeout = ?t, "alertStream heartbeat timeout");
                        }
                        Err(e) => {
                            warn!(device = %self.ip, error = %e, "alertStream error");
                        }
                        Ok(()) => {}
                    }
                }
            }

            if *shutdown.borrow() {
                break;
            }
            info!(device = %self.ip, delay = ?self.reconnect_delay, "reconnecting alertStream");
            tokio::select! {
                _ = shutdown.changed() => break,
                () = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
        info!(device = %self.ip, "alertStream client stopped");
    }

    async fn connect_and_stream(
        &self,
        client: &reqwest::Client,
        digest: &mut DigestState,
    ) -> Result<(), StreamError> {
        let url = format!("http://{}{}", self.ip, ALERT_STREAM_PATH);
        info!(device = %self.ip, %url, "connecting alertStream");

        let mut response = client
            .get(&url)
            .header("Connection", "Keep-Alive")
            .send()
            .await?;

        // Digest handshake: exactly one retry per 401 challenge.
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get("WWW-Authenticate")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if digest.handle_challenge(challenge).is_err() {
                return Err(StreamError::AuthFailed);
            }
            let authorization = digest
                .authorization("GET", ALERT_STREAM_PATH)
                .ok_or(StreamError::AuthFailed)?;
            response = client
                .get(&url)
                .header("Connection", "Keep-Alive")
                .header("Authorization", authorization)
                .send()
                .await?;
        }
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(StreamError::AuthFailed);
        }
        if !response.status().is_success() {
            return Err(StreamError::BadStatus(response.status().as_u16()));
        }

        let boundary = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(boundary_from_content_type)
            .unwrap_or_default();
        info!(device = %self.ip, %boundary, "alertStream connected");

        let mut splitter = StreamSplitter::new(&boundary);
        let mut stream = response.bytes_stream();

        loop {
            let chunk = tokio::time::timeout(self.heartbeat_timeout, stream.next()).await;
            match chunk {
                Err(_) => return Err(StreamError::HeartbeatTimeout(self.heartbeat_timeout)),
                Ok(None) => return Err(StreamError::Ended),
                Ok(Some(Err(e))) => return Err(StreamError::Http(e)),
                Ok(Some(Ok(bytes))) => {
                    for part in splitter.push(&bytes) {
                        self.handle_part(part).await;
                    }
                }
            }
        }
    }

    async fn handle_part(&self, part: isapi_core::Part) {
        match part.kind {
            PartKind::Image => {
                debug!(device = %self.ip, len = part.body.len(), "alertStream image part skipped");
            }
            PartKind::Xml => {
                let text = String::from_utf8_lossy(&part.body);
                match parse_alerts(&text) {
                    Ok(alerts) => {
                        for alert in &alerts {
                            BridgeMetrics::incr(&self.metrics.isapi_events_received);

                            if !self.allowed_device_ids.is_empty() {
                                let device_id = alert.device_id.as_deref().unwrap_or("");
                                if !self.allowed_device_ids.contains(device_id) {
                                    debug!(device_id, "skipping alert from unlisted device");
                                    continue;
                                }
                            }
                            if let Some(event_type) = &alert.event_type {
                                debug!(device = %self.ip, %event_type, "alertStream event");
                            }

                            let event = normalize_isapi(
                                alert,
                                EventSource::IsapiStream,
                                &self.ip,
                                &self.rules,
                            );
                            BridgeMetrics::incr(&self.metrics.events_received);
                            if self.tx.send(event).await.is_ok() {
                                BridgeMetrics::incr(&self.metrics.isapi_events_processed);
                            }
                        }
                    }
                    Err(e) => {
                        warn!(device = %self.ip, error = %e, "alertStream XML part did not parse");
                    }
                }
            }
            PartKind::Json => {
                debug!(device = %self.ip, "alertStream JSON part skipped");
            }
            PartKind::Unknown => {
                debug!(device = %self.ip, len = part.body.len(), "alertStream unknown part skipped");
            }
        }
    }
}
