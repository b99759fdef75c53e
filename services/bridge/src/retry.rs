//! Periodic replay of the pending store.
//!
//! Every `retry_interval` the loop loads all queued records and offers
//! each to the dispatcher, sequentially to cap the upstream burst.  A
//! record leaves the store only after a 2xx.  Records whose tenant has
//! vanished from the catalog are skipped, not deleted -- a config fix
//! brings them back into rotation.

use crate::pipeline::DispatchContext;
use acs_protocol::UpstreamPayload;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::metrics::BridgeMetrics;

/// Replay every queued record once.  Returns `(delivered, failed)`.
pub async fn replay_once(ctx: &DispatchContext) -> (usize, usize) {
    let records = ctx.store.load_all().await;
    if records.is_empty() {
        return (0, 0);
    }
    debug!(count = records.len(), "replaying pending events");

    let mut delivered = 0;
    let mut failed = 0;
    for stored in records {
        let Some(tenant) = ctx.tenants.tenant(&stored.record.tenant) else {
            warn!(
                tenant = %stored.record.tenant,
                path = %stored.path.display(),
                "pending record references unknown tenant, leaving in place"
            );
            continue;
        };

        let payload = UpstreamPayload::from_event(&stored.record.event, &tenant.name);
        if ctx.dispatcher.deliver(&tenant, &payload).await.is_delivered() {
            match ctx.store.remove(&stored.path).await {
                Ok(()) => {
                    BridgeMetrics::incr(&ctx.metrics.events_retried_ok);
                    delivered += 1;
                }
                Err(e) => {
                    // Delivered but not removed: the record will replay
                    // again (at-least-once, never lost).
                    warn!(path = %stored.path.display(), error = %e, "failed to remove delivered record");
                }
            }
        } else {
            BridgeMetrics::incr(&ctx.metrics.events_retried_fail);
            failed += 1;
        }
    }

    if delivered > 0 || failed > 0 {
        info!(delivered, failed, "pending replay pass complete");
    }
    (delivered, failed)
}

/// Run the replay loop until shutdown.
pub async fn run(ctx: DispatchContext, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    loop {
        replay_once(&ctx).await;
        let _ = ctx.store.cleanup_old().await;

        tokio::select! {
            _ = shutdown.changed() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }
    info!("retry loop stopped");
}
