//! Per-source correlation cache for image-only webhook requests.
//!
//! Some firmware delivers an XML alert in one POST and the matching JPEG
//! in a second, image-only POST moments later.  The cache remembers the
//! last XML seen per client address so the image can be attached to it.
//!
//! Best-effort: expired entries are swept on access, and the map is capped
//! by evicting the oldest entry.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

struct Entry {
    stored_at: Instant,
    xml: String,
}

/// TTL cache mapping client address -> last XML document.
pub struct CorrelationCache {
    ttl: Duration,
    max_entries: usize,
    inner: Mutex<HashMap<String, Entry>>,
}

impl CorrelationCache {
    pub fn new(ttl: Duration) -> CorrelationCache {
        CorrelationCache {
            ttl,
            max_entries: 256,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Remember the last XML for `client_addr`.
    pub fn put(&self, client_addr: &str, xml: &str) {
        let Ok(mut map) = self.inner.lock() else { return };
        if map.len() >= self.max_entries && !map.contains_key(client_addr) {
            if let Some(oldest) = map
                .iter()
                .min_by_key(|(_, e)| e.stored_at)
                .map(|(k, _)| k.clone())
            {
                map.remove(&oldest);
            }
        }
        map.insert(
            client_addr.to_owned(),
            Entry {
                stored_at: Instant::now(),
                xml: xml.to_owned(),
            },
        );
    }

    /// The last XML from `client_addr`, if still within the TTL.
    pub fn get(&self, client_addr: &str) -> Option<String> {
        let mut map = self.inner.lock().ok()?;
        let now = Instant::now();
        map.retain(|_, e| now.duration_since(e.stored_at) <= self.ttl);
        map.get(client_addr).map(|e| e.xml.clone())
    }
}
