//! `GET /ISAPI/System/deviceInfo` response parsing.

use crate::alert::AlertParseError;

/// Identity fields reported by a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: Option<String>,
    pub model: Option<String>,
}

impl DeviceInfo {
    /// Device IDs are expected to be 8-32 hex characters; anything else is
    /// a misconfigured or spoofed unit.
    pub fn has_valid_device_id(&self) -> bool {
        match &self.device_id {
            Some(id) => {
                (8..=32).contains(&id.len()) && id.bytes().all(|b| b.is_ascii_hexdigit())
            }
            None => false,
        }
    }
}

/// Parse a `<DeviceInfo>` document.
pub fn parse_device_info(xml: &str) -> Result<DeviceInfo, AlertParseError> {
    let doc = roxmltree::Document::parse(xml)
        .map_err(|e| AlertParseError::Malformed(e.to_string()))?;
    let root = doc.root_element();

    let text_of = |name: &str| -> Option<String> {
        root.children()
            .find(|n| n.is_element() && n.tag_name().name() == name)
            .and_then(|n| n.text())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_owned)
    };

    Ok(DeviceInfo {
        device_id: text_of("deviceID"),
        model: text_of("model"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_id_and_model() {
        let xml = "<DeviceInfo xmlns=\"http://www.hikvision.com/ver20/XMLSchema\">\
<deviceID>AB12CD34EF56</deviceID><model>DS-K1T341AM</model></DeviceInfo>";
        let info = parse_device_info(xml).unwrap();
        assert_eq!(info.device_id.as_deref(), Some("AB12CD34EF56"));
        assert_eq!(info.model.as_deref(), Some("DS-K1T341AM"));
        assert!(info.has_valid_device_id());
    }

    #[test]
    fn short_or_non_hex_device_ids_are_invalid() {
        for id in ["AB12", "ZZZZZZZZZZ", ""] {
            let info = DeviceInfo {
                device_id: Some(id.to_owned()),
                model: None,
            };
            assert!(!info.has_valid_device_id(), "id '{}'", id);
        }
        assert!(
            !DeviceInfo {
                device_id: None,
                model: None
            }
            .has_valid_device_id()
        );
    }

    #[test]
    fn malformed_document_is_an_error() {
        assert!(parse_device_info("<DeviceInfo>").is_err());
    }
}
