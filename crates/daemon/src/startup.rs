//! Startup coordinator: runs the nine stages in fixed order, emits one
//! progress event per transition, and fails fast with typed error codes.
//!
//! Only the `downloading` stage may be skipped (when the sidecar reports a
//! cached model); every other stage must complete in sequence. Any stage
//! timeout or typed error leaves the core in the failed state — startup is
//! never silently degraded.

use std::future::Future;

use semadex_core::{CoreError, ErrorCode, StartupStage, UiEvent};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{error, info};

pub struct StartupCoordinator {
  events: Option<mpsc::Sender<UiEvent>>,
  ready_tx: watch::Sender<bool>,
}

impl StartupCoordinator {
  pub fn new(events: Option<mpsc::Sender<UiEvent>>) -> (Self, watch::Receiver<bool>) {
    let (ready_tx, ready_rx) = watch::channel(false);
    (Self { events, ready_tx }, ready_rx)
  }

  /// Run one stage under its timeout. Emits the stage event on success and
  /// the error envelope on failure.
  pub async fn stage<T, F>(&self, stage: StartupStage, fut: F) -> Result<T, CoreError>
  where
    F: Future<Output = Result<T, CoreError>>,
  {
    info!(stage = ?stage, "Startup stage");
    match timeout(stage.timeout(), fut).await {
      Ok(Ok(value)) => {
        self.emit(UiEvent::stage(stage)).await;
        Ok(value)
      }
      Ok(Err(e)) => {
        self.fail(&e).await;
        Err(e)
      }
      Err(_) => {
        let e = CoreError::typed(
          ErrorCode::StartupTimeout,
          format!("stage {stage:?} exceeded {:?}", stage.timeout()),
        );
        self.fail(&e).await;
        Err(e)
      }
    }
  }

  /// Emit progress for a stage whose work was skipped. Per the stage-skip
  /// contract this only ever applies to `downloading`.
  pub async fn skip(&self, stage: StartupStage) {
    debug_assert!(stage.can_skip(), "only downloading is skippable");
    info!(stage = ?stage, "Startup stage skipped");
    self.emit(UiEvent::stage(stage)).await;
  }

  pub fn mark_ready(&self) {
    let _ = self.ready_tx.send(true);
  }

  async fn fail(&self, e: &CoreError) {
    error!(error = %e, "Startup failed");
    let (message, details) = match e {
      CoreError::Typed { message, details, .. } => (message.clone(), details.clone()),
      other => (other.to_string(), None),
    };
    self.emit(UiEvent::error(e.code(), message, details)).await;
  }

  async fn emit(&self, event: UiEvent) {
    if let Some(events) = &self.events {
      let _ = events.send(event).await;
    }
  }
}
