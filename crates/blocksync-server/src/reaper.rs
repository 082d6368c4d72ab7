//! Periodic eviction of stalled participants.
//!
//! A participant that stops sending frames keeps its presence entry and
//! leases until this task notices the stale last-seen timestamp and
//! synthesizes a disconnect: fire the session's eviction signal so the
//! transport closes, then run the same idempotent Closing procedure the
//! session itself would. Racing a concurrent session close is safe —
//! lease release and `USER_LEFT` happen at most once under the room lock.

use std::{sync::Arc, time::Instant};

use blocksync_core::{RoomCtx, RoomRegistry};
use blocksync_proto::close;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Run the reaper until `shutdown` fires. Cancellable between sweeps.
pub async fn run(registry: Arc<RoomRegistry>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(registry.config().reaper_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => sweep(&registry).await,
        }
    }
    tracing::debug!("reaper stopped");
}

async fn sweep(registry: &RoomRegistry) {
    for ctx in registry.rooms() {
        let now = Instant::now();
        let stale = ctx.driver().await.stale(now);
        for client_id in stale {
            tracing::info!(
                room = %ctx.record().id,
                client = %client_id,
                "reaping stale participant"
            );
            reap(&ctx, client_id, now).await;
        }
    }
}

async fn reap(ctx: &Arc<RoomCtx>, client_id: uuid::Uuid, now: Instant) {
    // Signal the transport first so the session task stops reading, then
    // tear the room state down on its behalf.
    if let Some(handle) = ctx.hub().get(client_id) {
        handle.evict(close::NORMAL, "presence timeout");
    }
    let mut driver = ctx.driver().await;
    let effects = driver.close(client_id, now);
    ctx.apply(&effects);
}
