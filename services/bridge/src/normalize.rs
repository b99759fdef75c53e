//! Mapping from device-protocol events to [`NormalizedEvent`].
//!
//! All field-name aliasing and heuristic inference happens here; nothing
//! downstream inspects protocol-specific shapes.

use acs_protocol::{AccessMethod, Direction, EventSource, ImageData, NormalizedEvent};
use isapi_core::AlertEvent;
use isup_core::{AccessEvent, Frame, PassDirection, VerifyMode};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// ISUP
// ---------------------------------------------------------------------------

/// Build a normalized event from a decoded ISUP access event.
///
/// `packet` is the full frame (header + body); it is preserved as uppercase
/// hex in `raw` for audit.
pub fn normalize_isup(
    frame: &Frame,
    access: &AccessEvent,
    packet: &[u8],
    client_addr: &str,
) -> NormalizedEvent {
    NormalizedEvent {
        source: EventSource::Isup,
        device_id: frame.header.device_id.clone(),
        client_addr: client_addr.to_owned(),
        timestamp: access.timestamp.to_string(),
        card_number: Some(access.card_number.clone()),
        user_id: Some(access.user_id.to_string()),
        direction: match access.direction {
            PassDirection::In => Direction::In,
            PassDirection::Out => Direction::Out,
            PassDirection::Unknown => Direction::Unknown,
        },
        access_method: match access.verify_mode {
            VerifyMode::Card => AccessMethod::Card,
            VerifyMode::Fingerprint => AccessMethod::Fingerprint,
            VerifyMode::Face => AccessMethod::Face,
            VerifyMode::Pin => AccessMethod::Pin,
            VerifyMode::Qr => AccessMethod::Qr,
            VerifyMode::Combined => AccessMethod::Combined,
            VerifyMode::Unknown => AccessMethod::Unknown,
        },
        success: access.success(),
        door_id: Some(access.door),
        reader_id: Some(access.reader),
        major_event_type: None,
        minor_event_type: None,
        raw: hex::encode_upper(packet),
        pic_url: None,
        images: None,
    }
}

// ---------------------------------------------------------------------------
// ISAPI
// ---------------------------------------------------------------------------

/// Site-specific interpretation knobs for ISAPI alerts.
#[derive(Debug, Clone)]
pub struct IsapiRules {
    /// Odd readerID means entry; false inverts the convention.
    pub odd_reader_in: bool,
    /// minorEventType values treated as a granted access.
    pub success_minor_types: Vec<String>,
}

impl IsapiRules {
    pub fn from_config(cfg: &crate::config::IsapiConfig) -> IsapiRules {
        IsapiRules {
            odd_reader_in: cfg.odd_reader_in,
            success_minor_types: cfg.success_minor_types.clone(),
        }
    }
}

/// Build a normalized event from a parsed `EventNotificationAlert`.
///
/// `timestamp` falls back to the ingestion time when the device omitted
/// `dateTime`.
pub fn normalize_isapi(
    alert: &AlertEvent,
    source: EventSource,
    client_addr: &str,
    rules: &IsapiRules,
) -> NormalizedEvent {
    let direction = match alert.reader_id.as_deref().and_then(|r| r.parse::<u64>().ok()) {
        Some(reader) => {
            let odd = reader % 2 == 1;
            if odd == rules.odd_reader_in {
                Direction::In
            } else {
                Direction::Out
            }
        }
        None => Direction::Unknown,
    };

    let success = alert
        .minor_event_type
        .as_deref()
        .is_some_and(|minor| rules.success_minor_types.iter().any(|s| s == minor));

    let images = alert.pic_data.as_ref().map(|bytes| {
        let mut map = BTreeMap::new();
        map.insert("picData".to_owned(), ImageData(bytes.clone()));
        map
    });

    NormalizedEvent {
        source,
        device_id: alert.device_key().to_owned(),
        client_addr: client_addr.to_owned(),
        timestamp: alert
            .date_time
            .clone()
            .unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
        card_number: alert.card_no.clone(),
        user_id: alert.employee_no.clone(),
        direction,
        access_method: infer_access_method(alert),
        success,
        door_id: alert.door_id.as_deref().and_then(|d| d.parse().ok()),
        reader_id: alert.reader_id.as_deref().and_then(|r| r.parse().ok()),
        major_event_type: alert.major_event_type.clone(),
        minor_event_type: alert.minor_event_type.clone(),
        raw: alert.raw.clone(),
        pic_url: alert.pic_url.clone(),
        images,
    }
}

/// Best-effort method inference: the alert schema has no dedicated field,
/// so read it off the event type, falling back to the presence of a card
/// number.
fn infer_access_method(alert: &AlertEvent) -> AccessMethod {
    let event_type = alert.event_type.as_deref().unwrap_or("").to_lowercase();
    if event_type.contains("face") {
        return AccessMethod::Face;
    }
    if event_type.contains("qr") {
        return AccessMethod::Qr;
    }
    if event_type.contains("fingerprint") {
        return AccessMethod::Fingerprint;
    }
    if alert.card_no.is_some() {
        return AccessMethod::Card;
    }
    AccessMethod::Unknown
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use isup_core::{CrcMode, encode_frame, parse_access_event, parse_frame};

    fn rules() -> IsapiRules {
        IsapiRules {
            odd_reader_in: true,
            success_minor_types: vec!["1".to_owned()],
        }
    }

    fn isup_body() -> Vec<u8> {
        let mut body = vec![0u8, 0, 1, 1];
        body.extend_from_slice(&42u32.to_be_bytes());
        body.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        body.extend_from_slice(&[24, 9, 12, 14, 23, 10]);
        body.extend_from_slice(&[1, 1, 1]);
        body
    }

    #[test]
    fn isup_card_event_maps_all_fields() {
        let packet = encode_frame(0x05, 0x01, "TERM000000000001", 1, &isup_body());
        let frame = parse_frame(&packet, CrcMode::Strict).unwrap();
        let access = parse_access_event(&frame.body).unwrap();

        let event = normalize_isup(&frame, &access, &packet, "192.0.2.7:40112");
        assert_eq!(event.source, EventSource::Isup);
        assert_eq!(event.device_id, "TERM000000000001");
        assert_eq!(event.card_number.as_deref(), Some("0102030405060708"));
        assert_eq!(event.user_id.as_deref(), Some("42"));
        assert_eq!(event.direction, Direction::In);
        assert_eq!(event.access_method, AccessMethod::Card);
        assert!(event.success);
        assert_eq!(event.door_id, Some(1));
        assert_eq!(event.reader_id, Some(1));
        assert_eq!(event.timestamp, "2024-09-12T14:23:10");
        assert_eq!(event.raw, hex::encode_upper(&packet));
    }

    fn alert(reader_id: Option<&str>, minor: Option<&str>) -> AlertEvent {
        AlertEvent {
            event_type: Some("AccessControllerEvent".to_owned()),
            mac_address: Some("AA:BB:CC:DD:EE:01".to_owned()),
            date_time: Some("2024-09-12T14:23:10+08:00".to_owned()),
            card_no: Some("1234567890".to_owned()),
            employee_no: Some("EMP1".to_owned()),
            reader_id: reader_id.map(str::to_owned),
            minor_event_type: minor.map(str::to_owned),
            raw: "<EventNotificationAlert/>".to_owned(),
            ..AlertEvent::default()
        }
    }

    #[test]
    fn odd_reader_is_in_even_is_out() {
        let event = normalize_isapi(
            &alert(Some("3"), Some("1")),
            EventSource::IsapiWebhook,
            "192.0.2.10",
            &rules(),
        );
        assert_eq!(event.direction, Direction::In);
        assert!(event.success);
        assert_eq!(event.device_id, "AA:BB:CC:DD:EE:01");

        let event = normalize_isapi(
            &alert(Some("4"), Some("1")),
            EventSource::IsapiWebhook,
            "192.0.2.10",
            &rules(),
        );
        assert_eq!(event.direction, Direction::Out);
    }

    #[test]
    fn inverted_reader_convention() {
        let mut inverted = rules();
        inverted.odd_reader_in = false;
        let event = normalize_isapi(
            &alert(Some("3"), None),
            EventSource::IsapiStream,
            "192.0.2.10",
            &inverted,
        );
        assert_eq!(event.direction, Direction::Out);
    }

    #[test]
    fn non_numeric_reader_is_unknown_direction() {
        let event = normalize_isapi(
            &alert(Some("main-door"), None),
            EventSource::IsapiWebhook,
            "192.0.2.10",
            &rules(),
        );
        assert_eq!(event.direction, Direction::Unknown);
        assert_eq!(event.reader_id, None);

        let event = normalize_isapi(
            &alert(None, None),
            EventSource::IsapiWebhook,
            "192.0.2.10",
            &rules(),
        );
        assert_eq!(event.direction, Direction::Unknown);
    }

    #[test]
    fn success_follows_configured_minor_types() {
        let mut custom = rules();
        custom.success_minor_types = vec!["1".to_owned(), "75".to_owned()];
        let event = normalize_isapi(
            &alert(Some("1"), Some("75")),
            EventSource::IsapiWebhook,
            "192.0.2.10",
            &custom,
        );
        assert!(event.success);

        let event = normalize_isapi(
            &alert(Some("1"), Some("2")),
            EventSource::IsapiWebhook,
            "192.0.2.10",
            &custom,
        );
        assert!(!event.success);

        let event = normalize_isapi(
            &alert(Some("1"), None),
            EventSource::IsapiWebhook,
            "192.0.2.10",
            &custom,
        );
        assert!(!event.success);
    }

    #[test]
    fn timestamp_falls_back_to_ingestion_time() {
        let mut a = alert(Some("1"), Some("1"));
        a.date_time = None;
        let event = normalize_isapi(&a, EventSource::IsapiWebhook, "192.0.2.10", &rules());
        // RFC 3339 from chrono; just check it is non-empty and year-led.
        assert!(event.timestamp.len() >= 19);
        assert!(event.timestamp.starts_with("20"));
    }

    #[test]
    fn face_event_type_wins_over_card_presence() {
        let mut a = alert(Some("1"), Some("1"));
        a.event_type = Some("faceMatch".to_owned());
        let event = normalize_isapi(&a, EventSource::IsapiStream, "192.0.2.10", &rules());
        assert_eq!(event.access_method, AccessMethod::Face);
    }

    #[test]
    fn pic_data_becomes_an_attached_image() {
        let mut a = alert(Some("1"), Some("1"));
        a.pic_data = Some(vec![0xFF, 0xD8]);
        let event = normalize_isapi(&a, EventSource::IsapiWebhook, "192.0.2.10", &rules());
        let images = event.images.unwrap();
        assert_eq!(images["picData"].as_bytes(), &[0xFF, 0xD8]);
    }
}
