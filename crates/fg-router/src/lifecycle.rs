//! Background expiry sweep for correlation groups

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::aggregator::Aggregator;

/// Periodically reap expired groups and purge stale closed markers until
/// `shutdown` fires.
pub fn spawn_group_reaper(
    aggregator: Arc<Aggregator>,
    interval: Duration,
    shutdown: &broadcast::Sender<()>,
) -> JoinHandle<()> {
    let mut shutdown_rx = shutdown.subscribe();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = interval.as_millis() as u64, "Group reaper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = aggregator.reap_expired().await;
                    if reaped > 0 {
                        debug!(reaped = reaped, "Reaped expired correlation groups");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Group reaper shutting down");
                    break;
                }
            }
        }
    })
}
