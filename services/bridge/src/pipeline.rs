//! Ingest channel and dispatch worker.
//!
//! Listeners push normalized events into a bounded channel and return to
//! their sockets immediately; this worker owns the slow path (tenant
//! resolution, upstream delivery, pending-store fallback).  ACK latency on
//! the ISUP side therefore never depends on upstream health.

use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::metrics::BridgeMetrics;
use crate::storage::pending::PendingStore;
use crate::tenants::TenantDirectory;
use acs_protocol::{NormalizedEvent, UpstreamPayload};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Everything the dispatch worker (and the retry loop) needs.
#[derive(Clone)]
pub struct DispatchContext {
    pub tenants: Arc<TenantDirectory>,
    pub dispatcher: Arc<Dispatcher>,
    pub store: Arc<PendingStore>,
    pub metrics: Arc<BridgeMetrics>,
}

impl DispatchContext {
    /// Route one event: resolve its tenant, deliver, persist on failure.
    ///
    /// Events from devices with no tenant binding are dropped (never
    /// queued) so a misconfigured device cannot grow the store unbounded.
    pub async fn handle_event(&self, event: NormalizedEvent) {
        self.metrics.mark_event(&event.timestamp);

        let Some(tenant) = self.tenants.find_tenant(&event.device_id) else {
            error!(
                device_id = %event.device_id,
                client_addr = %event.client_addr,
                "no tenant bound to device, dropping event"
            );
            return;
        };

        let payload = UpstreamPayload::from_event(&event, &tenant.name);
        match self.dispatcher.deliver(&tenant, &payload).await {
            DispatchOutcome::Delivered => {
                BridgeMetrics::incr(&self.metrics.events_ok);
            }
            outcome => {
                BridgeMetrics::incr(&self.metrics.events_failed);
                warn!(tenant = %tenant.name, ?outcome, "delivery failed, queueing event");
                if let Err(e) = self.store.save(&tenant.name, &event).await {
                    // The only spot where durability is sacrificed; must
                    // stay loud enough for monitoring to catch.
                    error!(error = %e, tenant = %tenant.name, "failed to persist pending event, event lost");
                }
            }
        }
    }
}

/// Spawn the dispatch worker.  Returns the ingest sender and the worker
/// handle.  On shutdown the channel is closed and the backlog drained.
pub fn start(
    ctx: DispatchContext,
    queue_depth: usize,
    mut shutdown: watch::Receiver<bool>,
) -> (mpsc::Sender<NormalizedEvent>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<NormalizedEvent>(queue_depth);

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    rx.close();
                    // Drain whatever was already queued.
                    while let Some(event) = rx.recv().await {
                        ctx.handle_event(event).await;
                    }
                    break;
                }
                received = rx.recv() => match received {
                    Some(event) => ctx.handle_event(event).await,
                    None => break,
                },
            }
        }
        info!("dispatch worker stopped");
    });

    (tx, handle)
}
