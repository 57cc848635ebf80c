//! On-disk schema version gate.
//!
//! The marker file `.db-version` holds a single integer. When the code's
//! declared version exceeds the on-disk value, or the marker is absent or
//! unreadable, the table directories are erased and the store is re-created.
//! There is no in-place migration for breaking schema changes.

use std::path::Path;

use tracing::{info, warn};

use crate::connection::Result;

pub const VERSION_MARKER: &str = ".db-version";

const TABLE_DIRS: &[&str] = &["chunks.lance", "file_status.lance"];

/// Read the marker file. `None` for missing, unreadable, empty or
/// non-integer content — all treated as a mismatch by the gate.
pub fn read_marker(data_root: &Path) -> Option<u32> {
  let raw = std::fs::read_to_string(data_root.join(VERSION_MARKER)).ok()?;
  raw.trim().parse().ok()
}

/// Run the gate before any table is opened. Returns `true` when the store
/// was erased and must be rebuilt from scratch.
pub async fn ensure_schema_version(data_root: &Path, version: u32) -> Result<bool> {
  match read_marker(data_root) {
    Some(on_disk) if on_disk == version => Ok(false),
    found => {
      warn!(
        on_disk = ?found,
        declared = version,
        "Schema version mismatch, rebuilding store"
      );
      for dir in TABLE_DIRS {
        let path = data_root.join(dir);
        if path.exists() {
          tokio::fs::remove_dir_all(&path).await?;
        }
      }
      let marker = data_root.join(VERSION_MARKER);
      if marker.exists() {
        tokio::fs::remove_file(&marker).await?;
      }
      Ok(true)
    }
  }
}

/// Persist the declared version after tables are opened or created.
pub async fn write_marker(data_root: &Path, version: u32) -> Result<()> {
  tokio::fs::write(data_root.join(VERSION_MARKER), version.to_string()).await?;
  info!(version, "Schema version marker written");
  Ok(())
}
