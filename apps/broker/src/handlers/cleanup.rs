//! CleanupHandler - periodic request log retention
//!
//! Runs on an interval and deletes log entries older than the retention
//! window. Relay traffic never waits on it.

use chrono::Utc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tunnelhub_common::utils::retention_cutoff;

use crate::AppState;
use crate::logs::LogStore;

/// One retention sweep; returns how many entries were deleted
pub fn run_cleanup(logs: &dyn LogStore, retention: Duration) -> usize {
    let Some(cutoff) = retention_cutoff(Utc::now(), retention) else {
        warn!("Retention window {:?} is out of range, skipping cleanup", retention);
        return 0;
    };

    let deleted = logs.purge_older_than(cutoff);
    if deleted > 0 {
        info!("Cleanup completed: {} log entries older than {} deleted", deleted, cutoff);
    } else {
        debug!("Cleanup completed: nothing older than {}", cutoff);
    }
    deleted
}

/// Spawn the retention task; the first sweep runs one interval after start
pub fn spawn_cleanup_task(state: &AppState) -> JoinHandle<()> {
    let logs = state.logs.clone();
    let retention = state.config.log_retention;
    let period = state.config.cleanup_interval;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            run_cleanup(logs.as_ref(), retention);
        }
    })
}
