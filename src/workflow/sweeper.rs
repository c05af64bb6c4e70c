//! Periodic timeout sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::engine::WorkflowEngine;

/// Shortest sweep period; smaller intervals are raised to this.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Spawn a task that times out expired `awaiting_reply` records every
/// `interval`. Stateless: each tick re-queries the store.
pub fn spawn_timeout_sweeper(
    engine: Arc<WorkflowEngine>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(MIN_SWEEP_INTERVAL));
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = engine.sweep_timeouts(Utc::now()).await {
                tracing::error!(error = %e, "Timeout sweep failed");
            }
        }
    })
}
