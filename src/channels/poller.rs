//! Item poller: pulls pending items from the source and starts workflows.
//!
//! Each cycle:
//! 1. Fetches pending items from the item source
//! 2. Skips items that already have a workflow
//! 3. Submits at most `max_items_per_poll` new ones, driven concurrently

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channels::ItemSource;
use crate::error::{Error, WorkflowError};
use crate::workflow::WorkflowEngine;

/// Shortest poll period; smaller intervals are raised to this.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Spawn a background task that polls `source` every `interval`.
pub fn spawn_item_poller(
    engine: Arc<WorkflowEngine>,
    source: Arc<dyn ItemSource>,
    interval: Duration,
    max_items_per_poll: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_secs = interval.as_secs(),
            max_items_per_poll, "Item poller started"
        );

        let mut tick = tokio::time::interval(interval.max(MIN_POLL_INTERVAL));
        loop {
            tick.tick().await;
            poll_once(&engine, source.as_ref(), max_items_per_poll).await;
        }
    })
}

/// Run a single poll cycle. Returns how many workflows were started.
pub async fn poll_once(
    engine: &WorkflowEngine,
    source: &dyn ItemSource,
    max_items_per_poll: usize,
) -> usize {
    let items = match source.fetch_pending().await {
        Ok(items) => items,
        Err(e) => {
            error!(error = %e, "Item poll failed");
            return 0;
        }
    };

    let mut fresh = Vec::new();
    for item in items {
        match engine.get(&item.item_id).await {
            Ok(Some(_)) => debug!(item_id = %item.item_id, "Already tracked"),
            Ok(None) => fresh.push(item),
            Err(e) => warn!(item_id = %item.item_id, error = %e, "Lookup failed; skipping"),
        }
    }

    if fresh.len() > max_items_per_poll {
        warn!(
            found = fresh.len(),
            limit = max_items_per_poll,
            "Poll limit reached, deferring remaining items"
        );
        fresh.truncate(max_items_per_poll);
    }
    if fresh.is_empty() {
        return 0;
    }

    let results = join_all(fresh.into_iter().map(|item| {
        let item_id = item.item_id.clone();
        async move { (item_id, engine.submit_new_item(item).await) }
    }))
    .await;

    let mut started = 0;
    for (item_id, result) in results {
        match result {
            Ok(_) => started += 1,
            Err(Error::Workflow(WorkflowError::DuplicateItem { .. })) => {
                debug!(item_id = %item_id, "Submitted concurrently elsewhere");
            }
            Err(e) => error!(item_id = %item_id, error = %e, "Failed to start workflow"),
        }
    }
    info!(started, "Poll cycle complete");
    started
}
