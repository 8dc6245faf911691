//! Periodic liveness reaper.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::tracker::NodeHeartbeatTracker;

/// Poll [`NodeHeartbeatTracker::check_liveness`] every `check_interval`
/// until `shutdown` fires.
pub async fn run_liveness_loop(
    tracker: Arc<NodeHeartbeatTracker>,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = tracker.config().check_interval;
    info!(interval_ms = interval.as_millis() as u64, "liveness loop started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let transitions = tracker.check_liveness();
                if !transitions.is_empty() {
                    debug!(count = transitions.len(), "liveness transitions");
                }
            }
            _ = shutdown.changed() => {
                info!("liveness loop shutting down");
                break;
            }
        }
    }
}
