//! The sidecar's stdout progress protocol.
//!
//! The subprocess emits one `PROGRESS:<json>` line per event. The event set
//! is closed, so it is a tagged enum; any stdout line that does not parse as
//! a progress event is treated as log output.

use serde::{Deserialize, Serialize};

pub const PROGRESS_PREFIX: &str = "PROGRESS:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SidecarEvent {
  /// Model weights already on disk; the downloading stage can be skipped.
  ModelCached { model: String },
  DownloadStarted { model: String },
  ModelLoaded { model: String, dimensions: usize },
}

/// Parse one stdout line. `None` means "not a progress event" — forward the
/// line to the log instead.
pub fn parse_progress_line(line: &str) -> Option<SidecarEvent> {
  let payload = line.strip_prefix(PROGRESS_PREFIX)?;
  serde_json::from_str(payload.trim()).ok()
}
