//! Tolerant multipart splitting for ISAPI payloads.
//!
//! Device firmware is loose about framing: some controllers separate part
//! headers with bare LF, some send keep-alive filler parts with empty
//! bodies, some omit the closing `--` marker.  This splitter accepts all
//! of it and classifies each part for downstream routing.

use std::collections::BTreeMap;
use tracing::debug;

// ---------------------------------------------------------------------------
// Part
// ---------------------------------------------------------------------------

/// Classification of a multipart part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartKind {
    Xml,
    Json,
    Image,
    Unknown,
}

/// One part of a multipart payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// Header map with lowercased names.
    pub headers: BTreeMap<String, String>,
    /// Raw body bytes.
    pub body: Vec<u8>,
    pub kind: PartKind,
}

impl Part {
    /// Lowercased `content-type`, or the empty string.
    pub fn content_type(&self) -> &str {
        self.headers.get("content-type").map_or("", String::as_str)
    }

    /// Lowercased `content-disposition`, or the empty string.
    pub fn content_disposition(&self) -> &str {
        self.headers
            .get("content-disposition")
            .map_or("", String::as_str)
    }

    /// The `filename="..."` parameter of the Content-Disposition header.
    pub fn filename(&self) -> Option<String> {
        disposition_param(self.content_disposition(), "filename")
    }

    /// The `name="..."` parameter of the Content-Disposition header.
    pub fn name(&self) -> Option<String> {
        disposition_param(self.content_disposition(), "name")
    }
}

fn disposition_param(disposition: &str, param: &str) -> Option<String> {
    for piece in disposition.split(';') {
        let piece = piece.trim();
        if let Some(rest) = piece.strip_prefix(param) {
            let rest = rest.trim_start();
            if let Some(value) = rest.strip_prefix('=') {
                return Some(value.trim().trim_matches('"').to_owned());
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Boundary extraction
// ---------------------------------------------------------------------------

/// Extract the `boundary=` parameter from a Content-Type header value.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    for param in content_type.split(';') {
        let param = param.trim();
        if let Some(value) = param
            .strip_prefix("boundary=")
            .or_else(|| param.strip_prefix("BOUNDARY="))
            .or_else(|| param.strip_prefix("Boundary="))
        {
            let value = value.trim().trim_matches('"');
            if !value.is_empty() {
                return Some(value.to_owned());
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Splitting
// ---------------------------------------------------------------------------

/// Split a complete multipart body on `"--" + boundary` and return the
/// non-empty parts in order.
///
/// Parts with empty bodies are discarded as keep-alive filler.  Header
/// blocks are separated from bodies by either `\r\n\r\n` or `\n\n`.
pub fn split_parts(stream: &[u8], boundary: &str) -> Vec<Part> {
    let mut parts = Vec::new();
    if boundary.is_empty() {
        debug!("no boundary supplied to multipart splitter");
        return parts;
    }

    let marker = format!("--{}", boundary).into_bytes();
    for segment in split_on(stream, &marker) {
        if let Some(part) = parse_segment(segment) {
            parts.push(part);
        }
    }
    debug!(parts = parts.len(), boundary, "multipart split complete");
    parts
}

/// Parse one boundary-delimited segment into a part, or `None` when the
/// segment is filler (empty, a bare closing marker, or an empty body).
fn parse_segment(segment: &[u8]) -> Option<Part> {
    let mut seg = trim_leading_crlf(segment);
    // Closing-marker segment ("--", possibly with trailing newlines).
    if let Some(stripped) = trim_trailing_crlf(seg).strip_suffix(b"--") {
        seg = stripped;
    }

    let (raw_headers, body) = match find_header_split(seg) {
        Some((h, b)) => (h, b),
        None => (&[][..], seg),
    };
    let body = trim_trailing_crlf(body);
    if body.is_empty() {
        return None;
    }

    let headers = parse_headers(raw_headers);
    let kind = detect_kind(headers.get("content-type").map_or("", String::as_str), body);
    Some(Part {
        headers,
        body: body.to_vec(),
        kind,
    })
}

/// Locate the header/body separator: `\r\n\r\n` or `\n\n`, whichever
/// occurs first.
fn find_header_split(segment: &[u8]) -> Option<(&[u8], &[u8])> {
    let crlf = find(segment, b"\r\n\r\n").map(|i| (i, i + 4));
    let lf = find(segment, b"\n\n").map(|i| (i, i + 2));
    let (start, end) = match (crlf, lf) {
        (Some(c), Some(l)) => {
            if l.0 < c.0 {
                l
            } else {
                c
            }
        }
        (Some(c), None) => c,
        (None, Some(l)) => l,
        (None, None) => return None,
    };
    Some((&segment[..start], &segment[end..]))
}

fn parse_headers(raw: &[u8]) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    for line in raw.split(|&b| b == b'\n') {
        let line = trim_crlf(line);
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        let key = String::from_utf8_lossy(&line[..colon])
            .trim()
            .to_lowercase();
        let value = String::from_utf8_lossy(&line[colon + 1..]).trim().to_owned();
        if !key.is_empty() {
            headers.insert(key, value);
        }
    }
    headers
}

/// Classify a part from its Content-Type, falling back to body sniffing.
fn detect_kind(content_type: &str, body: &[u8]) -> PartKind {
    if !content_type.is_empty() {
        let ct = content_type.to_lowercase();
        if ct.contains("xml") {
            return PartKind::Xml;
        }
        if ct.contains("jpeg") || ct.contains("jpg") || ct.starts_with("image/") {
            return PartKind::Image;
        }
        if ct.contains("json") {
            return PartKind::Json;
        }
    }

    let trimmed = trim_ascii_start(body);
    if trimmed.first() == Some(&b'<') {
        return PartKind::Xml;
    }
    if let Ok(text) = std::str::from_utf8(trimmed) {
        match text.trim_start().as_bytes().first() {
            Some(b'{') | Some(b'[') => return PartKind::Json,
            _ => {}
        }
    }
    PartKind::Unknown
}

// ---------------------------------------------------------------------------
// StreamSplitter (rolling buffer for alert streams)
// ---------------------------------------------------------------------------

/// Incremental splitter for a streamed multipart body.
///
/// Bytes are appended chunk by chunk; every complete boundary-delimited
/// segment is returned as a parsed [`Part`] and the trailing incomplete
/// segment is retained for the next push.
#[derive(Debug)]
pub struct StreamSplitter {
    marker: Vec<u8>,
    buffer: Vec<u8>,
}

impl StreamSplitter {
    pub fn new(boundary: &str) -> StreamSplitter {
        StreamSplitter {
            marker: format!("--{}", boundary).into_bytes(),
            buffer: Vec::new(),
        }
    }

    /// Append a chunk and drain all complete parts.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Part> {
        // Without a boundary there is nothing to split; drop the bytes
        // rather than buffering them forever.
        if self.marker.len() <= 2 {
            return Vec::new();
        }
        self.buffer.extend_from_slice(chunk);

        let mut segments: Vec<Vec<u8>> = split_on(&self.buffer, &self.marker)
            .into_iter()
            .map(|segment| segment.to_vec())
            .collect();

        // The final segment may still be growing; keep it as the remainder.
        let remainder = segments.pop().unwrap_or_default();
        self.buffer = if trim_crlf(&remainder) == b"--" || trim_crlf(&remainder).is_empty() {
            Vec::new()
        } else {
            remainder
        };

        segments
            .into_iter()
            .filter_map(|segment| parse_segment(&segment))
            .collect()
    }

    /// Bytes currently held as the incomplete trailing segment.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

// ---------------------------------------------------------------------------
// Byte helpers
// ---------------------------------------------------------------------------

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn split_on<'a>(data: &'a [u8], marker: &[u8]) -> Vec<&'a [u8]> {
    let mut segments = Vec::new();
    let mut rest = data;
    while let Some(pos) = find(rest, marker) {
        segments.push(&rest[..pos]);
        rest = &rest[pos + marker.len()..];
    }
    segments.push(rest);
    segments
}

fn trim_leading_crlf(mut data: &[u8]) -> &[u8] {
    while let Some((&first, tail)) = data.split_first() {
        if first == b'\r' || first == b'\n' {
            data = tail;
        } else {
            break;
        }
    }
    data
}

fn trim_trailing_crlf(mut data: &[u8]) -> &[u8] {
    while let Some((&last, head)) = data.split_last() {
        if last == b'\r' || last == b'\n' {
            data = head;
        } else {
            break;
        }
    }
    data
}

fn trim_crlf(data: &[u8]) -> &[u8] {
    trim_trailing_crlf(trim_leading_crlf(data))
}

fn trim_ascii_start(mut data: &[u8]) -> &[u8] {
    while let Some((&first, tail)) = data.split_first() {
        if first.is_ascii_whitespace() {
            data = tail;
        } else {
            break;
        }
    }
    data
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const XML_BODY: &str = "<EventNotificationAlert><eventType>test</eventType></EventNotificationAlert>";

    fn form_data(boundary: &str, parts: &[(&str, &[u8])]) -> Vec<u8> {
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

    #[test]
    fn boundary_is_extracted_from_content_type() {
        assert_eq!(
            boundary_from_content_type("multipart/form-data; boundary=abc123"),
            Some("abc123".to_owned())
        );
        assert_eq!(
            boundary_from_content_type("multipart/mixed; boundary=\"quoted\"; charset=utf-8"),
            Some("quoted".to_owned())
        );
        assert_eq!(boundary_from_content_type("application/xml"), None);
        assert_eq!(boundary_from_content_type(""), None);
    }

    #[test]
    fn splits_xml_and_image_parts() {
        let body = form_data(
            "bnd",
            &[
                (
                    "Content-Type: application/xml; charset=UTF-8",
                    XML_BODY.as_bytes(),
                ),
                (
                    "Content-Type: image/jpeg\r\nContent-Disposition: form-data; name=\"pic\"; filename=\"cap.jpg\"",
                    &[0xFF, 0xD8, 0xFF, 0xE0],
                ),
            ],
        );
        let parts = split_parts(&body, "bnd");
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].kind, PartKind::Xml);
        assert_eq!(parts[0].body, XML_BODY.as_bytes());
        assert_eq!(parts[1].kind, PartKind::Image);
        assert_eq!(parts[1].filename().as_deref(), Some("cap.jpg"));
        assert_eq!(parts[1].name().as_deref(), Some("pic"));
    }

    #[test]
    fn lf_only_header_separator_is_accepted() {
        let mut body = Vec::new();
        body.extend_from_slice(b"--bnd\n");
        body.extend_from_slice(b"Content-Type: application/xml\n\n");
        body.extend_from_slice(XML_BODY.as_bytes());
        body.extend_from_slice(b"\n--bnd--\n");

        let parts = split_parts(&body, "bnd");
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].kind, PartKind::Xml);
        assert_eq!(parts[0].body, XML_BODY.as_bytes());
    }

    #[test]
    fn headerless_segment_is_sniffed() {
        let mut body = Vec::new();
        body.extend_from_slice(b"--bnd\r\n");
        body.extend_from_slice(XML_BODY.as_bytes());
        body.extend_from_slice(b"\r\n--bnd--");

        let parts = split_parts(&body, "bnd");
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].kind, PartKind::Xml);
        assert!(parts[0].headers.is_empty());
    }

    #[test]
    fn json_sniffing() {
        let mut body = Vec::new();
        body.extend_from_slice(b"--bnd\r\n\r\n");
        body.extend_from_slice(b"  {\"k\": 1}");
        body.extend_from_slice(b"\r\n--bnd--");
        let parts = split_parts(&body, "bnd");
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].kind, PartKind::Json);
    }

    #[test]
    fn undecodable_body_is_unknown() {
        let mut body = Vec::new();
        body.extend_from_slice(b"--bnd\r\n\r\n");
        body.extend_from_slice(&[0x00, 0x9F, 0x92, 0x96]);
        body.extend_from_slice(b"\r\n--bnd--");
        let parts = split_parts(&body, "bnd");
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].kind, PartKind::Unknown);
    }

    #[test]
    fn boundary_only_body_yields_no_parts() {
        let body = b"--bnd\r\n--bnd\r\n--bnd--\r\n";
        assert!(split_parts(body, "bnd").is_empty());
    }

    #[test]
    fn empty_bodies_are_discarded_as_keepalive() {
        let mut body = Vec::new();
        body.extend_from_slice(b"--bnd\r\nContent-Type: text/plain\r\n\r\n\r\n");
        body.extend_from_slice(b"--bnd--");
        assert!(split_parts(&body, "bnd").is_empty());
    }

    #[test]
    fn empty_boundary_yields_no_parts() {
        assert!(split_parts(XML_BODY.as_bytes(), "").is_empty());
    }

    #[test]
    fn stream_splitter_retains_incomplete_tail() {
        let mut splitter = StreamSplitter::new("bnd");
        let full = form_data("bnd", &[("Content-Type: application/xml", XML_BODY.as_bytes())]);

        // Feed everything except the closing marker in two chunks.
        let cut = full.len() / 2;
        let first = splitter.push(&full[..cut]);
        assert!(first.is_empty());
        let second = splitter.push(&full[cut..]);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].kind, PartKind::Xml);
        assert_eq!(second[0].body, XML_BODY.as_bytes());
        // The closing "--" remainder is dropped, not carried forever.
        assert_eq!(splitter.pending_len(), 0);
    }

    #[test]
    fn stream_splitter_handles_parts_across_many_small_chunks() {
        let mut splitter = StreamSplitter::new("bnd");
        let full = form_data(
            "bnd",
            &[
                ("Content-Type: application/xml", XML_BODY.as_bytes()),
                ("Content-Type: image/jpeg", &[0xFF, 0xD8]),
            ],
        );

        let mut parts = Vec::new();
        for chunk in full.chunks(7) {
            parts.extend(splitter.push(chunk));
        }
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].kind, PartKind::Xml);
        assert_eq!(parts[1].kind, PartKind::Image);
    }
}
