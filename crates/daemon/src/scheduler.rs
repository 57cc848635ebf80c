//! Failure-retry timer: failed files become eligible again 24 hours after
//! their last attempt (parser upgrades and content changes retry sooner via
//! the planner and the watcher).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use db::Store;
use pipeline::{FileQueue, Priority};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
  pub interval: Duration,
  pub retry_after: chrono::Duration,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      interval: Duration::from_secs(3600),
      retry_after: chrono::Duration::hours(24),
    }
  }
}

pub fn spawn_retry_scheduler(
  store: Arc<Store>,
  queue: Arc<FileQueue>,
  config: SchedulerConfig,
  cancel: CancellationToken,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    loop {
      tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(config.interval) => {}
      }

      // Opportunistic ANN index rebuild while the store is idle. Not
      // required for correctness; failures are logged and ignored.
      if queue.is_empty() {
        match store.build_vector_index().await {
          Ok(true) => debug!("Vector index rebuilt"),
          Ok(false) => {}
          Err(e) => debug!(error = %e, "Vector index rebuild skipped"),
        }
      }

      let rows = match store.retryable_failures().await {
        Ok(rows) => rows,
        Err(e) => {
          warn!(error = %e, "Retry scan failed");
          continue;
        }
      };

      // The attempt itself stamps `last_retry` when it fails again, so the
      // scheduler only decides eligibility and re-queues.
      let now = Utc::now();
      for row in rows {
        if !retry_due(&row.last_retry, now, config.retry_after) {
          continue;
        }
        debug!(path = %row.path, "Re-queueing failed file after retry window");
        queue.push(PathBuf::from(&row.path), Priority::Modified);
      }
    }
  })
}

/// A failure with no recorded attempt time, or an unparsable one, is due
/// immediately; otherwise the retry window must have elapsed.
pub fn retry_due(last_retry: &str, now: DateTime<Utc>, retry_after: chrono::Duration) -> bool {
  if last_retry.is_empty() {
    return true;
  }
  match DateTime::parse_from_rfc3339(last_retry) {
    Ok(at) => now.signed_duration_since(at.with_timezone(&Utc)) >= retry_after,
    Err(_) => true,
  }
}
