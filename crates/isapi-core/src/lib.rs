// isapi-core: ISAPI event protocol building blocks.
//
// Tolerant multipart splitting, EventNotificationAlert XML parsing, and
// the RFC 7616 Digest challenge/response state machine shared by the
// alert-stream client and device provisioning.

pub mod alert;
pub mod device;
pub mod digest;
pub mod multipart;

pub use alert::{AlertEvent, AlertParseError, parse_alerts};
pub use device::{DeviceInfo, parse_device_info};
pub use digest::{DigestError, DigestState};
pub use multipart::{Part, PartKind, StreamSplitter, boundary_from_content_type, split_parts};
