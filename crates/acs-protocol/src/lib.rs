// acs-protocol: Shared event schema and upstream payload types.
//
// All JSON surfaces (pending files on disk, upstream delivery bodies) are
// built from these types.  Field aliases from the device protocols are
// normalized at the ingestion boundaries -- nothing downstream of the
// normalizer ever sees `deviceID` vs `device_id` style variance.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Where an event entered the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSource {
    #[serde(rename = "ISUP")]
    Isup,
    #[serde(rename = "ISAPI_WEBHOOK")]
    IsapiWebhook,
    #[serde(rename = "ISAPI_STREAM")]
    IsapiStream,
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSource::Isup => write!(f, "ISUP"),
            EventSource::IsapiWebhook => write!(f, "ISAPI_WEBHOOK"),
            EventSource::IsapiStream => write!(f, "ISAPI_STREAM"),
        }
    }
}

/// Passage direction as reported (or inferred) at the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "IN")]
    In,
    #[serde(rename = "OUT")]
    Out,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => write!(f, "IN"),
            Direction::Out => write!(f, "OUT"),
            Direction::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// How the person identified themselves at the door.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessMethod {
    Card,
    Fingerprint,
    Face,
    Pin,
    Qr,
    Combined,
    Unknown,
}

impl fmt::Display for AccessMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessMethod::Card => "CARD",
            AccessMethod::Fingerprint => "FINGERPRINT",
            AccessMethod::Face => "FACE",
            AccessMethod::Pin => "PIN",
            AccessMethod::Qr => "QR",
            AccessMethod::Combined => "COMBINED",
            AccessMethod::Unknown => "UNKNOWN",
        };
        write!(f, "{}", s)
    }
}

// ---------------------------------------------------------------------------
// NormalizedEvent
// ---------------------------------------------------------------------------

/// The canonical internal representation of one access event.
///
/// Constructed exactly once per ingestion, then handed to the dispatcher.
/// Either the upstream accepts it with a 2xx, or it is materialized as a
/// [`PendingRecord`] on disk -- never both, never neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub source: EventSource,
    /// MAC-preferred device identity; falls back to the device-reported ID.
    pub device_id: String,
    /// Remote network address observed at ingestion.
    pub client_addr: String,
    /// ISO-8601; device-provided when present, ingestion time otherwise.
    pub timestamp: String,
    /// Uppercase hex for ISUP; decimal/hex as the device supplies for ISAPI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_number: Option<String>,
    /// Employee number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub direction: Direction,
    pub access_method: AccessMethod,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub door_id: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader_id: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub major_event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minor_event_type: Option<String>,
    /// Original packet (hex for ISUP) or document text, kept for audit.
    pub raw: String,
    /// Picture URL reported by the device; preserved, never fetched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pic_url: Option<String>,
    /// Attached images keyed by filename.  Base64 on the wire and on disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<BTreeMap<String, ImageData>>,
}

impl NormalizedEvent {
    /// Attach (or merge in) a set of images, e.g. from a correlated
    /// image-only multipart request.
    pub fn attach_images(&mut self, images: BTreeMap<String, ImageData>) {
        if images.is_empty() {
            return;
        }
        match &mut self.images {
            Some(existing) => existing.extend(images),
            None => self.images = Some(images),
        }
    }
}

// ---------------------------------------------------------------------------
// ImageData (bytes <-> base64)
// ---------------------------------------------------------------------------

/// Raw image bytes that serialize as a Base64 string.
///
/// JSON arrays of numbers are ruinous for JPEG-sized payloads; pending
/// files and audit logs carry images Base64-encoded instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData(pub Vec<u8>);

impl ImageData {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for ImageData {
    fn from(bytes: Vec<u8>) -> Self {
        ImageData(bytes)
    }
}

impl Serialize for ImageData {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use base64::Engine as _;
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for ImageData {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use base64::Engine as _;
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map(ImageData)
            .map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// PendingRecord
// ---------------------------------------------------------------------------

/// One queued event as persisted on disk (`<pending_id>.json`).
///
/// `tenant` is resolved before queueing; the retry loop routes by this
/// stored name so a catalog change never strands a record silently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRecord {
    pub pending_id: uuid::Uuid,
    /// ISO-8601 time the record was written.
    pub saved_at: String,
    pub tenant: String,
    pub event: NormalizedEvent,
}

// ---------------------------------------------------------------------------
// UpstreamPayload
// ---------------------------------------------------------------------------

/// The JSON body POSTed to a tenant's accounting endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub employee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card: Option<String>,
    pub timestamp: String,
    pub direction: Direction,
    pub success: bool,
    pub device: String,
    pub raw: String,
    pub source: EventSource,
    pub tenant: String,
}

impl UpstreamPayload {
    pub fn from_event(event: &NormalizedEvent, tenant: &str) -> Self {
        UpstreamPayload {
            employee: event.user_id.clone(),
            card: event.card_number.clone(),
            timestamp: event.timestamp.clone(),
            direction: event.direction,
            success: event.success,
            device: event.device_id.clone(),
            raw: event.raw.clone(),
            source: event.source,
            tenant: tenant.to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
