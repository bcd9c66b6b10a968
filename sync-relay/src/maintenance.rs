//! Background maintenance for the relay.
//!
//! Runs periodically to evict idle rate limiter keys and drop join table
//! entries whose connections are gone.

use crate::config::MaintenanceConfig;
use crate::server::SignalRelay;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

/// One maintenance pass. Returns the number of join entries pruned.
pub fn run_maintenance(relay: &SignalRelay) -> usize {
    relay.rate_limits().shrink();
    relay.prune_closed()
}

/// Spawn the background maintenance task.
///
/// The task exits when `shutdown` is cancelled.
pub fn spawn_maintenance_task(
    relay: Arc<SignalRelay>,
    config: MaintenanceConfig,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("Maintenance task disabled");
            return;
        }

        let interval_secs = config.interval_secs.max(1);
        tracing::info!("Maintenance task started (interval: {}s)", interval_secs);

        let mut timer = interval(Duration::from_secs(interval_secs));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }

            let pruned = run_maintenance(&relay);
            if pruned > 0 {
                tracing::info!("Maintenance: pruned {} stale joins", pruned);
            } else {
                tracing::debug!(
                    "Maintenance: {} joined, {} limiter keys",
                    relay.joined_count(),
                    relay.rate_limits().signal_keys_count()
                );
            }
        }

        tracing::info!("Maintenance task stopped");
    })
}
