//! Webhook listener behavior over real HTTP.
//!
//! A real axum listener on a random port, with the dispatch channel
//! drained directly by the tests (no upstream involved).

use acs_protocol::NormalizedEvent;
use bridge::correlation::CorrelationCache;
use bridge::metrics::BridgeMetrics;
use bridge::normalize::IsapiRules;
use bridge::webhook::{self, WebhookState};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

const ALERT_PATH: &str = "/ISAPI/Event/notification/alert";
const ACCESS_XML: &str = "<EventNotificationAlert>\
<eventType>AccessControllerEvent</eventType>\
<dateTime>2024-09-12T14:23:10+08:00</dateTime>\
<macAddress>AA:BB:CC:DD:EE:01</macAddress>\
<AccessControllerEvent>\
<cardNo>1234567890</cardNo>\
<employeeNo>EMP1</employeeNo>\
<readerID>3</readerID>\
<minorEventType>1</minorEventType>\
</AccessControllerEvent>\
</EventNotificationAlert>";

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct WebhookHarness {
    base_url: String,
    rx: mpsc::Receiver<NormalizedEvent>,
    metrics: Arc<BridgeMetrics>,
    _shutdown: watch::Sender<bool>,
}

async fn start_webhook(
    secret: Option<&str>,
    allowed: &[&str],
    correlation_ttl: Duration,
) -> WebhookHarness {
    let (tx, rx) = mpsc::channel(64);
    let metrics = Arc::new(BridgeMetrics::new());
    let state = WebhookState {
        secret: secret.map(str::to_owned),
        callback_secret: None,
        rules: IsapiRules {
            odd_reader_in: true,
            success_minor_types: vec!["1".to_owned()],
        },
        allowed_device_ids: Arc::new(allowed.iter().map(|s| (*s).to_owned()).collect::<HashSet<_>>()),
        cache: Arc::new(CorrelationCache::new(correlation_ttl)),
        tx,
        metrics: metrics.clone(),
    };

    let router = webhook::build_router(state, ALERT_PATH, "/hikvision/callback");
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(webhook::serve(listener, router, shutdown_rx));
    tokio::time::sleep(Duration::from_millis(20)).await;

    WebhookHarness {
        base_url: format!("http://{}", addr),
        rx,
        metrics,
        _shutdown: shutdown_tx,
    }
}

fn multipart_body(boundary: &str, parts: &[(&str, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (headers, part_body) in parts {
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(headers.as_bytes());
        body.extend_from_slice(b"\r\n\r\n");
        body.extend_from_slice(part_body);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
    body
}

async fn recv_event(harness: &mut WebhookHarness) -> NormalizedEvent {
    tokio::time::timeout(Duration::from_secs(2), harness.rx.recv())
        .await
        .expect("timed out waiting for dispatched event")
        .expect("channel closed")
}

// ---------------------------------------------------------------------------
// Plain XML and heartbeats
// ---------------------------------------------------------------------------

#[tokio::test]
async fn xml_post_is_normalized_and_dispatched() {
    let mut harness = start_webhook(None, &[], Duration::from_secs(30)).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}{}", harness.base_url, ALERT_PATH))
        .header("Content-Type", "application/xml")
        .body(ACCESS_XML)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json["status"], "success");

    let event = recv_event(&mut harness).await;
    assert_eq!(event.device_id, "AA:BB:CC:DD:EE:01");
    assert_eq!(event.direction, acs_protocol::Direction::In); // reader 3 is odd
    assert!(event.success);
    assert_eq!(event.card_number.as_deref(), Some("1234567890"));
    assert_eq!(event.user_id.as_deref(), Some("EMP1"));
    assert_eq!(event.source, acs_protocol::EventSource::IsapiWebhook);
}

#[tokio::test]
async fn root_path_accepts_posts_too() {
    let mut harness = start_webhook(None, &[], Duration::from_secs(30)).await;
    let response = reqwest::Client::new()
        .post(&harness.base_url)
        .header("Content-Type", "application/xml")
        .body(ACCESS_XML)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let _ = recv_event(&mut harness).await;
}

#[tokio::test]
async fn empty_body_is_a_heartbeat_with_no_dispatch() {
    let mut harness = start_webhook(None, &[], Duration::from_secs(30)).await;
    for body in ["", "   \r\n  "] {
        let response = reqwest::Client::new()
            .post(format!("{}{}", harness.base_url, ALERT_PATH))
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }
    assert!(harness.rx.try_recv().is_err());
    assert_eq!(harness.metrics.events_received.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn garbage_body_is_a_400() {
    let harness = start_webhook(None, &[], Duration::from_secs(30)).await;
    let response = reqwest::Client::new()
        .post(format!("{}{}", harness.base_url, ALERT_PATH))
        .header("Content-Type", "text/plain")
        .body("definitely not an event")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn batched_alerts_dispatch_one_event_each() {
    let mut harness = start_webhook(None, &[], Duration::from_secs(30)).await;
    let xml = "<EventNotificationAlertList>\
<EventNotificationAlert><macAddress>AA:BB:CC:DD:EE:01</macAddress><AccessControllerEvent><readerID>1</readerID></AccessControllerEvent></EventNotificationAlert>\
<EventNotificationAlert><macAddress>AA:BB:CC:DD:EE:02</macAddress><AccessControllerEvent><readerID>2</readerID></AccessControllerEvent></EventNotificationAlert>\
</EventNotificationAlertList>";
    let response = reqwest::Client::new()
        .post(format!("{}{}", harness.base_url, ALERT_PATH))
        .header("Content-Type", "application/xml")
        .body(xml)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let first = recv_event(&mut harness).await;
    let second = recv_event(&mut harness).await;
    assert_eq!(first.device_id, "AA:BB:CC:DD:EE:01");
    assert_eq!(first.direction, acs_protocol::Direction::In);
    assert_eq!(second.device_id, "AA:BB:CC:DD:EE:02");
    assert_eq!(second.direction, acs_protocol::Direction::Out);
}

// ---------------------------------------------------------------------------
// Secret gate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn wrong_or_missing_secret_is_rejected() {
    let harness = start_webhook(Some("s3cret"), &[], Duration::from_secs(30)).await;
    let client = reqwest::Client::new();
    let url = format!("{}{}", harness.base_url, ALERT_PATH);

    let response = client.post(&url).body(ACCESS_XML).send().await.unwrap();
    assert_eq!(response.status(), 401);

    let response = client
        .post(&url)
        .header("X-Webhook-Secret", "wrong")
        .body(ACCESS_XML)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = client
        .post(&url)
        .header("X-Webhook-Secret", "s3cret")
        .header("Content-Type", "application/xml")
        .body(ACCESS_XML)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

// ---------------------------------------------------------------------------
// Multipart
// ---------------------------------------------------------------------------

#[tokio::test]
async fn multipart_with_xml_and_image_attaches_the_image() {
    let mut harness = start_webhook(None, &[], Duration::from_secs(30)).await;
    let body = multipart_body(
        "bnd",
        &[
            ("Content-Type: application/xml", ACCESS_XML.as_bytes()),
            (
                "Content-Type: image/jpeg\r\nContent-Disposition: form-data; name=\"pic\"; filename=\"cap.jpg\"",
                &[0xFF, 0xD8, 0xFF, 0xE0],
            ),
        ],
    );
    let response = reqwest::Client::new()
        .post(format!("{}{}", harness.base_url, ALERT_PATH))
        .header("Content-Type", "multipart/form-data; boundary=bnd")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let event = recv_event(&mut harness).await;
    let images = event.images.expect("image must be attached");
    assert_eq!(images["cap.jpg"].as_bytes(), &[0xFF, 0xD8, 0xFF, 0xE0]);
}

#[tokio::test]
async fn multipart_of_only_boundaries_is_a_heartbeat() {
    let mut harness = start_webhook(None, &[], Duration::from_secs(30)).await;
    let response = reqwest::Client::new()
        .post(format!("{}{}", harness.base_url, ALERT_PATH))
        .header("Content-Type", "multipart/form-data; boundary=bnd")
        .body("--bnd\r\n--bnd--\r\n")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(harness.rx.try_recv().is_err());
}

#[tokio::test]
async fn multipart_without_boundary_falls_back_to_raw_scan() {
    let mut harness = start_webhook(None, &[], Duration::from_secs(30)).await;
    let response = reqwest::Client::new()
        .post(format!("{}{}", harness.base_url, ALERT_PATH))
        .header("Content-Type", "multipart/form-data")
        .body(format!("leading-junk{}trailing", ACCESS_XML))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let event = recv_event(&mut harness).await;
    assert_eq!(event.device_id, "AA:BB:CC:DD:EE:01");
}

// ---------------------------------------------------------------------------
// Image-only correlation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn image_only_request_correlates_with_recent_xml() {
    let mut harness = start_webhook(None, &[], Duration::from_secs(30)).await;
    let client = reqwest::Client::new();
    let url = format!("{}{}", harness.base_url, ALERT_PATH);

    // First POST: metadata only.
    client
        .post(&url)
        .header("Content-Type", "application/xml")
        .body(ACCESS_XML)
        .send()
        .await
        .unwrap();
    let first = recv_event(&mut harness).await;
    assert!(first.images.is_none());

    // Second POST from the same source: image only.
    let body = multipart_body(
        "bnd",
        &[(
            "Content-Type: image/jpeg\r\nContent-Disposition: form-data; name=\"pic\"; filename=\"cap.jpg\"",
            &[0xFF, 0xD8][..],
        )],
    );
    let response = client
        .post(&url)
        .header("Content-Type", "multipart/form-data; boundary=bnd")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json["status"], "success");

    // The prior XML is redispatched with the image attached.
    let second = recv_event(&mut harness).await;
    assert_eq!(second.device_id, "AA:BB:CC:DD:EE:01");
    let images = second.images.expect("correlated image must be attached");
    assert_eq!(images["cap.jpg"].as_bytes(), &[0xFF, 0xD8]);
}

#[tokio::test]
async fn image_only_request_after_ttl_is_accepted_without_dispatch() {
    // Tiny TTL so the test does not sleep for the production 30 s.
    let mut harness = start_webhook(None, &[], Duration::from_millis(150)).await;
    let client = reqwest::Client::new();
    let url = format!("{}{}", harness.base_url, ALERT_PATH);

    client
        .post(&url)
        .header("Content-Type", "application/xml")
        .body(ACCESS_XML)
        .send()
        .await
        .unwrap();
    let _ = recv_event(&mut harness).await;

    tokio::time::sleep(Duration::from_millis(300)).await;

    let body = multipart_body(
        "bnd",
        &[(
            "Content-Type: image/jpeg\r\nContent-Disposition: form-data; filename=\"cap.jpg\"",
            &[0xFF, 0xD8][..],
        )],
    );
    let response = client
        .post(&url)
        .header("Content-Type", "multipart/form-data; boundary=bnd")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json["status"], "accepted");
    assert!(harness.rx.try_recv().is_err(), "no dispatch after TTL expiry");
}

// ---------------------------------------------------------------------------
// Device allow-list
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unlisted_device_ids_are_skipped() {
    let mut harness = start_webhook(None, &["TRUSTED01"], Duration::from_secs(30)).await;
    let client = reqwest::Client::new();
    let url = format!("{}{}", harness.base_url, ALERT_PATH);

    let blocked = "<EventNotificationAlert><deviceID>ROGUE99</deviceID></EventNotificationAlert>";
    client
        .post(&url)
        .header("Content-Type", "application/xml")
        .body(blocked)
        .send()
        .await
        .unwrap();
    assert!(harness.rx.try_recv().is_err());

    let allowed = "<EventNotificationAlert><deviceID>TRUSTED01</deviceID></EventNotificationAlert>";
    client
        .post(&url)
        .header("Content-Type", "application/xml")
        .body(allowed)
        .send()
        .await
        .unwrap();
    let event = recv_event(&mut harness).await;
    assert_eq!(event.device_id, "TRUSTED01");
}
