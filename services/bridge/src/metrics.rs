//! Bridge counters and the `/metrics` snapshot.
//!
//! Counters are plain relaxed atomics -- they are mutated from every
//! listener task and read only for the snapshot, so no ordering beyond
//! the increment itself is needed.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide event counters.
///
/// Shared as `Arc<BridgeMetrics>`; constructors take it explicitly rather
/// than reaching for a global.
#[derive(Debug)]
pub struct BridgeMetrics {
    start_time: chrono::DateTime<chrono::Utc>,
    pub connections_total: AtomicU64,
    pub events_received: AtomicU64,
    pub events_parsed: AtomicU64,
    pub events_ok: AtomicU64,
    pub events_failed: AtomicU64,
    pub events_retried_ok: AtomicU64,
    pub events_retried_fail: AtomicU64,
    pub isapi_events_received: AtomicU64,
    pub isapi_events_processed: AtomicU64,
    last_event_time: Mutex<Option<String>>,
}

impl BridgeMetrics {
    pub fn new() -> BridgeMetrics {
        BridgeMetrics {
            start_time: chrono::Utc::now(),
            connections_total: AtomicU64::new(0),
            events_received: AtomicU64::new(0),
            events_parsed: AtomicU64::new(0),
            events_ok: AtomicU64::new(0),
            events_failed: AtomicU64::new(0),
            events_retried_ok: AtomicU64::new(0),
            events_retried_fail: AtomicU64::new(0),
            isapi_events_received: AtomicU64::new(0),
            isapi_events_processed: AtomicU64::new(0),
            last_event_time: Mutex::new(None),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the timestamp of the most recent event (ISO-8601).
    pub fn mark_event(&self, timestamp: &str) {
        if let Ok(mut guard) = self.last_event_time.lock() {
            *guard = Some(timestamp.to_owned());
        }
    }

    pub fn last_event_time(&self) -> Option<String> {
        self.last_event_time.lock().ok().and_then(|g| g.clone())
    }

    fn success_rate_percent(&self) -> f64 {
        let received = self.events_received.load(Ordering::Relaxed);
        if received == 0 {
            return 0.0;
        }
        let ok = self.events_ok.load(Ordering::Relaxed);
        (ok as f64 / received as f64) * 100.0
    }

    /// JSON snapshot served by the status endpoint.
    pub fn snapshot(&self, pending: u64) -> serde_json::Value {
        let uptime = (chrono::Utc::now() - self.start_time).num_seconds().max(0);
        serde_json::json!({
            "start_time": self.start_time.to_rfc3339(),
            "uptime_seconds": uptime,
            "connections_total": self.connections_total.load(Ordering::Relaxed),
            "events": {
                "received": self.events_received.load(Ordering::Relaxed),
                "parsed": self.events_parsed.load(Ordering::Relaxed),
                "ok": self.events_ok.load(Ordering::Relaxed),
                "failed": self.events_failed.load(Ordering::Relaxed),
                "pending": pending,
                "retries_ok": self.events_retried_ok.load(Ordering::Relaxed),
                "retries_failed": self.events_retried_fail.load(Ordering::Relaxed),
                "success_rate_percent": (self.success_rate_percent() * 100.0).round() / 100.0,
            },
            "isapi": {
                "received": self.isapi_events_received.load(Ordering::Relaxed),
                "processed": self.isapi_events_processed.load(Ordering::Relaxed),
            },
            "last_event_time": self.last_event_time(),
        })
    }
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}
