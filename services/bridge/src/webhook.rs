//! Inbound ISAPI webhook listener.
//!
//! Controllers and cameras POST `EventNotificationAlert` documents here,
//! as bare XML or wrapped in multipart with JPEG captures.  Firmware is
//! erratic: empty keep-alive bodies, multipart without a boundary
//! parameter, image-only requests whose metadata arrived in an earlier
//! POST.  The handler accepts all of it and answers 200 wherever possible
//! so devices do not enter retry storms; 400 is reserved for non-empty
//! bodies that yield no parsable alert.

use crate::correlation::CorrelationCache;
use crate::metrics::BridgeMetrics;
use crate::normalize::{IsapiRules, normalize_isapi};
use acs_protocol::{EventSource, ImageData, NormalizedEvent};
use axum::{
    Router,
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use isapi_core::{AlertParseError, Part, PartKind, boundary_from_content_type, parse_alerts, split_parts};
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct WebhookState {
    /// Shared-secret gate; `None` disables the check.
    pub secret: Option<String>,
    /// Alternative secret accepted on the device-manager callback path.
    pub callback_secret: Option<String>,
    pub rules: IsapiRules,
    /// When non-empty, alerts whose deviceID is not listed are skipped.
    pub allowed_device_ids: Arc<HashSet<String>>,
    pub cache: Arc<CorrelationCache>,
    pub tx: mpsc::Sender<NormalizedEvent>,
    pub metrics: Arc<BridgeMetrics>,
}

/// Build the webhook router: the configured alert path, the root path,
/// and the device-manager callback path all accept POSTs.
pub fn build_router(state: WebhookState, webhook_path: &str, callback_path: &str) -> Router {
    let mut router = Router::new().route("/", post(handle_alert));
    if webhook_path != "/" {
        router = router.route(webhook_path, post(handle_alert));
    }
    if callback_path != "/" && callback_path != webhook_path {
        router = router.route(callback_path, post(handle_alert));
    }
    router.with_state(state)
}

/// Serve the router until shutdown flips.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
    })
    .await?;
    info!("webhook listener stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

async fn handle_alert(
    State(state): State<WebhookState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // AUTH_GATE
    if state.secret.is_some() || state.callback_secret.is_some() {
        let provided = headers
            .get("X-Webhook-Secret")
            .and_then(|v| v.to_str().ok());
        let accepted = provided.is_some_and(|p| {
            state.secret.as_deref() == Some(p) || state.callback_secret.as_deref() == Some(p)
        });
        if !accepted {
            warn!(client = %addr, "webhook secret missing or mismatched");
            return status_json(StatusCode::UNAUTHORIZED, "unauthorized");
        }
    }

    let client_ip = addr.ip().to_string();

    // CLASSIFY_BODY: empty or whitespace-only is a keep-alive.
    if body.iter().all(u8::is_ascii_whitespace) {
        debug!(client = %client_ip, "webhook heartbeat");
        return status_json(StatusCode::OK, "success");
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_lowercase();

    let mut xml_data: Option<String> = None;
    let mut images: BTreeMap<String, ImageData> = BTreeMap::new();

    if content_type.starts_with("multipart/") {
        match boundary_from_content_type(&content_type) {
            None => {
                // Boundary lost in transit; fall back to a raw scan.
                xml_data = scan_for_alert(&body);
                if xml_data.is_none() {
                    debug!(client = %client_ip, "multipart without boundary or alert, treating as heartbeat");
                    return status_json(StatusCode::OK, "success");
                }
            }
            Some(boundary) => {
                let parts = split_parts(&body, &boundary);
                if parts.is_empty() {
                    debug!(client = %client_ip, "multipart with no parts, treating as heartbeat");
                    return status_json(StatusCode::OK, "success");
                }
                collect_parts(&parts, &mut xml_data, &mut images);
                if xml_data.is_none() {
                    xml_data = scan_for_alert(&body);
                }
            }
        }
    } else if content_type.contains("xml") || looks_like_xml(&body) {
        xml_data = Some(String::from_utf8_lossy(&body).into_owned());
    } else {
        xml_data = scan_for_alert(&body);
    }

    match xml_data {
        Some(xml) => {
            // Remember the metadata for image-only follow-ups.
            state.cache.put(&client_ip, &xml);
            match dispatch_alerts(&state, &xml, &client_ip, &images).await {
                Ok(count) => {
                    debug!(client = %client_ip, count, "webhook alerts dispatched");
                    status_json(StatusCode::OK, "success")
                }
                Err(e) => {
                    warn!(client = %client_ip, error = %e, "webhook XML parse failed");
                    status_json(StatusCode::BAD_REQUEST, "error")
                }
            }
        }
        None if !images.is_empty() => {
            // CACHE_CORRELATE: attach the capture to recent metadata.
            match state.cache.get(&client_ip) {
                Some(cached_xml) => {
                    match dispatch_alerts(&state, &cached_xml, &client_ip, &images).await {
                        Ok(count) => {
                            info!(client = %client_ip, count, images = images.len(),
                                "attached image-only request to cached alert");
                            status_json(StatusCode::OK, "success")
                        }
                        Err(e) => {
                            warn!(client = %client_ip, error = %e, "cached alert no longer parses");
                            status_json(StatusCode::OK, "accepted")
                        }
                    }
                }
                None => {
                    // Valid firmware pattern; accept silently.
                    debug!(client = %client_ip, "image-only request with no cached alert");
                    status_json(StatusCode::OK, "accepted")
                }
            }
        }
        None => {
            warn!(client = %client_ip, "non-empty webhook body with no recognizable alert");
            status_json(StatusCode::BAD_REQUEST, "error")
        }
    }
}

// ---------------------------------------------------------------------------
// Part accumulation
// ---------------------------------------------------------------------------

/// Sort scanner parts into XML metadata and named images.
fn collect_parts(
    parts: &[Part],
    xml_data: &mut Option<String>,
    images: &mut BTreeMap<String, ImageData>,
) {
    for (idx, part) in parts.iter().enumerate() {
        if is_image_part(part) {
            let filename = part
                .filename()
                .unwrap_or_else(|| format!("image_{}.jpg", idx + 1));
            images.insert(filename, ImageData(part.body.clone()));
        } else if is_xml_part(part) {
            *xml_data = Some(String::from_utf8_lossy(&part.body).into_owned());
        } else if part.kind == PartKind::Json {
            debug!("ignoring JSON webhook part");
        } else {
            debug!(len = part.body.len(), "ignoring unclassified webhook part");
        }
    }
}

fn is_image_part(part: &Part) -> bool {
    if part.kind == PartKind::Image {
        return true;
    }
    part.filename()
        .is_some_and(|f| f.ends_with(".jpg") || f.ends_with(".jpeg"))
}

fn is_xml_part(part: &Part) -> bool {
    if part.kind == PartKind::Xml {
        return true;
    }
    // Content-Disposition names devices use for the metadata part.
    part.name().is_some_and(|name| {
        let name = name.to_lowercase();
        ["event", "notification", "alert", "metadata"]
            .iter()
            .any(|hint| name.contains(hint))
    })
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Parse `xml`, normalize every alert, attach `images`, and hand the
/// events to the pipeline.  Returns the number of events dispatched.
async fn dispatch_alerts(
    state: &WebhookState,
    xml: &str,
    client_ip: &str,
    images: &BTreeMap<String, ImageData>,
) -> Result<usize, AlertParseError> {
    let alerts = parse_alerts(xml)?;
    let mut dispatched = 0;

    for alert in &alerts {
        BridgeMetrics::incr(&state.metrics.isapi_events_received);

        if !state.allowed_device_ids.is_empty() {
            let device_id = alert.device_id.as_deref().unwrap_or("");
            if !state.allowed_device_ids.contains(device_id) {
                debug!(device_id, "skipping alert from unlisted device");
                continue;
            }
        }

        let mut event = normalize_isapi(alert, EventSource::IsapiWebhook, client_ip, &state.rules);
        if !images.is_empty() {
            event.attach_images(images.clone());
        }

        BridgeMetrics::incr(&state.metrics.events_received);
        if state.tx.send(event).await.is_ok() {
            BridgeMetrics::incr(&state.metrics.isapi_events_processed);
            dispatched += 1;
        } else {
            warn!("dispatch channel closed, dropping webhook event");
        }
    }
    Ok(dispatched)
}

// ---------------------------------------------------------------------------
// Body helpers
// ---------------------------------------------------------------------------

fn looks_like_xml(body: &[u8]) -> bool {
    body.iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|&b| b == b'<')
}

/// Last-resort scan for an alert document embedded in an otherwise
/// unparseable body.
fn scan_for_alert(body: &[u8]) -> Option<String> {
    const OPEN: &str = "<EventNotificationAlert";
    const CLOSE: &str = "</EventNotificationAlert>";
    let text = String::from_utf8_lossy(body);
    let start = text.find(OPEN)?;
    let end = text[start..].find(CLOSE)? + start + CLOSE.len();
    Some(text[start..end].to_owned())
}

fn status_json(code: StatusCode, status: &str) -> Response {
    (code, axum::Json(serde_json::json!({ "status": status }))).into_response()
}

// ---------------------------------------------------------------------------
// Unit tests (pure helpers; HTTP behavior is covered in tests/)
// ---------------------------------------------------------------------------
