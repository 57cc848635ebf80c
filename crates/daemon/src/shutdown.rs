//! Shutdown orchestrator: eight-step drain with per-stage timeouts.
//!
//! Step 2 (file queue) has no timeout: chunks that parsed but never embedded
//! are user data. Steps 3 and 4 are best-effort; on expiry they log and the
//! orchestrator continues. A top-level watchdog forces process exit if the
//! orchestrator wedges past its theoretical deadline.

use std::sync::Arc;
use std::time::Duration;

use db::WriteHandle;
use embedding::SidecarService;
use pipeline::Pipeline;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
  pub embed_drain: Duration,
  pub write_drain: Duration,
  pub watchdog_grace: Duration,
}

impl Default for ShutdownConfig {
  fn default() -> Self {
    Self {
      embed_drain: Duration::from_secs(30),
      write_drain: Duration::from_secs(10),
      watchdog_grace: Duration::from_secs(5),
    }
  }
}

impl ShutdownConfig {
  /// Sum of the bounded steps plus slack; the unbounded file-queue drain is
  /// intentionally outside this figure.
  pub fn watchdog_deadline(&self) -> Duration {
    self.embed_drain + self.write_drain + Duration::from_secs(10) + self.watchdog_grace
  }
}

/// Force process exit if shutdown wedges. Abort the handle once the
/// orchestrator returns.
pub fn spawn_watchdog(deadline: Duration) -> JoinHandle<()> {
  tokio::spawn(async move {
    tokio::time::sleep(deadline).await;
    error!(?deadline, "Shutdown watchdog fired, forcing exit");
    std::process::exit(1);
  })
}

pub struct ShutdownParts {
  pub pipeline: Pipeline,
  pub writer: WriteHandle,
  pub writer_task: JoinHandle<()>,
  pub sidecar: Option<Arc<SidecarService>>,
  pub watch_task: Option<JoinHandle<()>>,
  pub scheduler_task: JoinHandle<()>,
  pub cancel: CancellationToken,
}

pub async fn run_shutdown(parts: ShutdownParts, config: &ShutdownConfig) {
  info!("Shutdown starting");

  // 1. Close the file watcher: no new work enters.
  if let Some(watch_task) = parts.watch_task {
    watch_task.abort();
  }

  // 2. Drain the file queue. No timeout: every discovered file must reach a
  //    terminal state.
  parts.pipeline.drain_files().await;
  debug!("File queue drained");

  // The remaining steps are bounded; the watchdog covers a wedge in any of
  // them from outside the orchestrator.
  let watchdog = spawn_watchdog(config.watchdog_deadline());

  // 3. Drain the embedding queue, best-effort.
  if timeout(config.embed_drain, parts.pipeline.drain_embed()).await.is_err() {
    warn!(limit = ?config.embed_drain, "Embedding queue drain timed out, continuing");
  }

  // 4. Drain the write queue, best-effort.
  if timeout(config.write_drain, parts.writer.flush()).await.is_err() {
    warn!(limit = ?config.write_drain, "Write queue drain timed out, continuing");
  }

  // 5. Profiling report, when enabled.
  if std::env::var("SEMADEX_PROFILE").is_ok() {
    info!(
      embed_queue = parts.pipeline.embed_gauge().current(),
      file_queue = parts.pipeline.queue.len(),
      "Shutdown profile"
    );
  }

  // 6. Clear periodic monitors.
  parts.pipeline.stop_monitors();
  parts.scheduler_task.abort();
  parts.cancel.cancel();

  // 7. Stop the embedder subprocess.
  if let Some(sidecar) = &parts.sidecar {
    sidecar.stop().await;
  }

  // 8. Close the store: let the pipeline tasks finish, drop the last write
  //    handle, and wait for the writer to apply what remains.
  parts.pipeline.join().await;
  drop(parts.writer);
  let _ = parts.writer_task.await;

  watchdog.abort();
  info!("Shutdown complete");
}
