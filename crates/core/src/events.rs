//! Startup progress and UI event envelopes.
//!
//! The event sets are closed, so they are modeled as tagged enums rather than
//! string-keyed maps.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

/// The nine startup stages, in fixed order.
///
/// Only `Downloading` may be skipped (when the sidecar reports a cached
/// model); every other stage must complete in sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupStage {
  WorkerSpawn,
  SidecarStart,
  Downloading,
  SidecarReady,
  EmbedderInit,
  DbInit,
  DbLoad,
  FolderScan,
  Ready,
}

impl StartupStage {
  pub const ALL: [StartupStage; 9] = [
    StartupStage::WorkerSpawn,
    StartupStage::SidecarStart,
    StartupStage::Downloading,
    StartupStage::SidecarReady,
    StartupStage::EmbedderInit,
    StartupStage::DbInit,
    StartupStage::DbLoad,
    StartupStage::FolderScan,
    StartupStage::Ready,
  ];

  /// Zero-based position in the fixed stage order.
  pub fn index(&self) -> usize {
    Self::ALL.iter().position(|s| s == self).expect("stage is in ALL")
  }

  /// Completion percentage after this stage finishes.
  pub fn percent(&self) -> f32 {
    (self.index() + 1) as f32 / Self::ALL.len() as f32 * 100.0
  }

  pub fn message(&self) -> &'static str {
    match self {
      StartupStage::WorkerSpawn => "Starting indexing workers",
      StartupStage::SidecarStart => "Launching embedding service",
      StartupStage::Downloading => "Downloading model weights",
      StartupStage::SidecarReady => "Waiting for embedding service",
      StartupStage::EmbedderInit => "Initializing embedder",
      StartupStage::DbInit => "Opening search database",
      StartupStage::DbLoad => "Loading file index",
      StartupStage::FolderScan => "Scanning folders",
      StartupStage::Ready => "Ready",
    }
  }

  /// Per-stage timeout. A stage that overruns is fatal for startup.
  pub fn timeout(&self) -> Duration {
    match self {
      StartupStage::WorkerSpawn => Duration::from_secs(10),
      StartupStage::SidecarStart => Duration::from_secs(30),
      // First-run model download over a slow link can take a while.
      StartupStage::Downloading => Duration::from_secs(600),
      StartupStage::SidecarReady => Duration::from_secs(30),
      StartupStage::EmbedderInit => Duration::from_secs(30),
      StartupStage::DbInit => Duration::from_secs(60),
      StartupStage::DbLoad => Duration::from_secs(60),
      StartupStage::FolderScan => Duration::from_secs(300),
      StartupStage::Ready => Duration::from_secs(5),
    }
  }

  pub fn can_skip(&self) -> bool {
    matches!(self, StartupStage::Downloading)
  }
}

/// Envelope posted to the UI collaborator.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload")]
pub enum UiEvent {
  #[serde(rename = "startup:stage")]
  StartupStage {
    stage: StartupStage,
    message: String,
    progress: f32,
  },

  #[serde(rename = "startup:error")]
  StartupError {
    code: ErrorCode,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
  },
}

impl UiEvent {
  pub fn stage(stage: StartupStage) -> Self {
    UiEvent::StartupStage {
      stage,
      message: stage.message().to_string(),
      progress: stage.percent(),
    }
  }

  pub fn error(code: ErrorCode, message: impl Into<String>, details: Option<String>) -> Self {
    UiEvent::StartupError {
      code,
      message: message.into(),
      details,
    }
  }
}
