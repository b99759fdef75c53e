//! `EventNotificationAlert` document parsing.
//!
//! Accepts a single alert document, a batch wrapper with multiple
//! `EventNotificationAlert` children, and the nested
//! `AccessControllerEvent` layout.  Field aliases (`dateTime` vs
//! `eventDateTime`) are resolved here so downstream code sees one shape.

use base64::Engine as _;
use std::fmt;
use tracing::warn;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertParseError {
    /// The document is not well-formed XML.
    Malformed(String),
}

impl fmt::Display for AlertParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertParseError::Malformed(s) => write!(f, "malformed alert XML: {}", s),
        }
    }
}

impl std::error::Error for AlertParseError {}

// ---------------------------------------------------------------------------
// AlertEvent
// ---------------------------------------------------------------------------

/// One parsed `EventNotificationAlert`.
///
/// All fields are optional -- firmware varies wildly in what it fills in.
/// [`AlertEvent::device_key`] is the identity used for tenant routing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AlertEvent {
    pub event_type: Option<String>,
    pub event_state: Option<String>,
    pub device_id: Option<String>,
    pub mac_address: Option<String>,
    pub ip_address: Option<String>,
    pub date_time: Option<String>,
    pub card_no: Option<String>,
    pub employee_no: Option<String>,
    pub door_id: Option<String>,
    pub reader_id: Option<String>,
    pub major_event_type: Option<String>,
    pub minor_event_type: Option<String>,
    /// Preserved as reported; never fetched.
    pub pic_url: Option<String>,
    /// Decoded from the Base64 `<picData>` element.
    pub pic_data: Option<Vec<u8>>,
    /// The source document text, kept for audit.
    pub raw: String,
}

impl AlertEvent {
    /// Routing identity: MAC address, then device ID, then `"unknown"`.
    pub fn device_key(&self) -> &str {
        self.mac_address
            .as_deref()
            .or(self.device_id.as_deref())
            .unwrap_or("unknown")
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse one or more `EventNotificationAlert` documents from `xml`.
///
/// A root `EventNotificationAlert` yields one event; a wrapper element
/// yields one event per `EventNotificationAlert` descendant.  A document
/// with neither is treated as a single (mostly empty) alert, matching
/// firmware that omits the standard root tag.
pub fn parse_alerts(xml: &str) -> Result<Vec<AlertEvent>, AlertParseError> {
    let doc = roxmltree::Document::parse(xml)
        .map_err(|e| AlertParseError::Malformed(e.to_string()))?;
    let root = doc.root_element();

    let nodes: Vec<roxmltree::Node> = if root.tag_name().name() == "EventNotificationAlert" {
        vec![root]
    } else {
        let found: Vec<_> = root
            .descendants()
            .filter(|n| n.is_element() && n.tag_name().name() == "EventNotificationAlert")
            .collect();
        if found.is_empty() { vec![root] } else { found }
    };

    Ok(nodes.into_iter().map(|node| parse_node(node, xml)).collect())
}

fn parse_node(node: roxmltree::Node, raw: &str) -> AlertEvent {
    let pic_data = field(node, &["picData"]).and_then(|text| {
        match base64::engine::general_purpose::STANDARD.decode(text.trim().as_bytes()) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(error = %e, "failed to decode picData");
                None
            }
        }
    });

    AlertEvent {
        event_type: field(node, &["eventType"]),
        event_state: field(node, &["eventState"]),
        device_id: field(node, &["deviceID"]),
        mac_address: field(node, &["macAddress"]),
        ip_address: field(node, &["ipAddress"]),
        date_time: field(node, &["dateTime", "eventDateTime"]),
        card_no: field(node, &["cardNo"]),
        employee_no: field(node, &["employeeNo"]),
        door_id: field(node, &["doorID"]),
        reader_id: field(node, &["readerID"]),
        major_event_type: field(node, &["majorEventType"]),
        minor_event_type: field(node, &["minorEventType"]),
        pic_url: field(node, &["picURL"]),
        pic_data,
        raw: raw.to_owned(),
    }
}

/// Look up the first non-empty text of any of `names`, checking the alert
/// node's direct children first and the nested `AccessControllerEvent`
/// element second.
fn field(node: roxmltree::Node, names: &[&str]) -> Option<String> {
    for name in names {
        if let Some(text) = child_text(node, name) {
            return Some(text);
        }
    }
    let nested = node
        .children()
        .find(|n| n.is_element() && n.tag_name().name() == "AccessControllerEvent")?;
    for name in names {
        if let Some(text) = child_text(nested, name) {
            return Some(text);
        }
    }
    None
}

fn child_text(node: roxmltree::Node, name: &str) -> Option<String> {
    let child = node
        .children()
        .find(|n| n.is_element() && n.tag_name().name() == name)?;
    let text = child.text().unwrap_or("").trim();
    if text.is_empty() { None } else { Some(text.to_owned()) }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const ACCESS_ALERT: &str = "<EventNotificationAlert>\
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

    #[test]
    fn single_alert_with_nested_access_fields() {
        let events = parse_alerts(ACCESS_ALERT).unwrap();
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e.event_type.as_deref(), Some("AccessControllerEvent"));
        assert_eq!(e.date_time.as_deref(), Some("2024-09-12T14:23:10+08:00"));
        assert_eq!(e.mac_address.as_deref(), Some("AA:BB:CC:DD:EE:01"));
        assert_eq!(e.card_no.as_deref(), Some("1234567890"));
        assert_eq!(e.employee_no.as_deref(), Some("EMP1"));
        assert_eq!(e.reader_id.as_deref(), Some("3"));
        assert_eq!(e.minor_event_type.as_deref(), Some("1"));
        assert_eq!(e.device_key(), "AA:BB:CC:DD:EE:01");
        assert_eq!(e.raw, ACCESS_ALERT);
    }

    #[test]
    fn event_date_time_alias_is_accepted() {
        let xml = "<EventNotificationAlert>\
<eventDateTime>2024-01-02T03:04:05</eventDateTime>\
</EventNotificationAlert>";
        let events = parse_alerts(xml).unwrap();
        assert_eq!(events[0].date_time.as_deref(), Some("2024-01-02T03:04:05"));
    }

    #[test]
    fn batched_wrapper_yields_one_event_per_alert() {
        let xml = "<EventNotificationAlertList>\
<EventNotificationAlert><deviceID>D1</deviceID></EventNotificationAlert>\
<EventNotificationAlert><deviceID>D2</deviceID></EventNotificationAlert>\
</EventNotificationAlertList>";
        let events = parse_alerts(xml).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].device_id.as_deref(), Some("D1"));
        assert_eq!(events[1].device_id.as_deref(), Some("D2"));
    }

    #[test]
    fn device_key_falls_back_to_device_id_then_unknown() {
        let xml = "<EventNotificationAlert><deviceID>DEV9</deviceID></EventNotificationAlert>";
        let events = parse_alerts(xml).unwrap();
        assert_eq!(events[0].device_key(), "DEV9");

        let xml = "<EventNotificationAlert><eventType>x</eventType></EventNotificationAlert>";
        let events = parse_alerts(xml).unwrap();
        assert_eq!(events[0].device_key(), "unknown");
    }

    #[test]
    fn pic_data_is_base64_decoded() {
        let xml = "<EventNotificationAlert>\
<AccessControllerEvent><picData>/9j/4A==</picData></AccessControllerEvent>\
</EventNotificationAlert>";
        let events = parse_alerts(xml).unwrap();
        assert_eq!(events[0].pic_data.as_deref(), Some(&[0xFF, 0xD8, 0xFF, 0xE0][..]));
    }

    #[test]
    fn invalid_pic_data_is_dropped_not_fatal() {
        let xml = "<EventNotificationAlert><picData>!!not-base64!!</picData></EventNotificationAlert>";
        let events = parse_alerts(xml).unwrap();
        assert!(events[0].pic_data.is_none());
    }

    #[test]
    fn pic_url_is_preserved_verbatim() {
        let xml = "<EventNotificationAlert>\
<picURL>http://192.0.2.9/pic/17.jpg</picURL>\
</EventNotificationAlert>";
        let events = parse_alerts(xml).unwrap();
        assert_eq!(
            events[0].pic_url.as_deref(),
            Some("http://192.0.2.9/pic/17.jpg")
        );
    }

    #[test]
    fn malformed_xml_is_an_error() {
        assert!(parse_alerts("<EventNotificationAlert>").is_err());
        assert!(parse_alerts("not xml at all").is_err());
    }

    #[test]
    fn unrecognized_root_is_treated_as_a_single_alert() {
        let xml = "<SomethingElse><deviceID>D1</deviceID></SomethingElse>";
        let events = parse_alerts(xml).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].device_id.as_deref(), Some("D1"));
    }
}
