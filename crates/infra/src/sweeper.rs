//! Periodic maintenance workers: command timeouts and discovery eviction.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::discovery::DiscoveryCache;
use crate::services::CommandDispatcher;
use crate::worker::WorkerHandle;

/// Run `sweep_timeouts` every `interval` until stopped.
pub fn spawn_timeout_sweeper(dispatcher: Arc<CommandDispatcher>, interval: Duration) -> WorkerHandle {
    WorkerHandle::spawn("command-timeout-sweeper", move |mut stop| async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop.stopped() => break,
                _ = ticker.tick() => {}
            }
            if let Err(err) = dispatcher.sweep_timeouts(Utc::now()).await {
                warn!(error = %err, "timeout sweep failed");
            }
        }
    })
}

/// Drop expired discoveries every `interval` until stopped.
pub fn spawn_discovery_eviction(cache: Arc<DiscoveryCache>, interval: Duration) -> WorkerHandle {
    WorkerHandle::spawn("discovery-eviction", move |mut stop| async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop.stopped() => break,
                _ = ticker.tick() => {}
            }
            let removed = cache.evict_expired(Utc::now());
            if removed > 0 {
                debug!(removed, "evicted expired discoveries");
            }
        }
    })
}
