//! Chunk and file-status data model shared by the store and the pipeline.

use serde::{Deserialize, Serialize};

/// One stored text chunk. The vector travels alongside, paired by position,
/// rather than inside the record (the store owns vector layout).
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
  /// Stable id derived from `(path, chunk_index)`.
  pub id: String,
  /// Absolute path of the source document.
  pub path: String,
  /// 0-based ordinal within the source document.
  pub chunk_index: u32,
  /// 1-based logical page number, 0 when inapplicable.
  pub page: u32,
  /// Character offset of the chunk within the extracted text.
  pub offset: u32,
  /// Exact extracted text. Never empty for a stored chunk.
  pub text: String,
  /// Display title (filename or embedded metadata).
  pub title: String,
  /// Lowercase extension.
  pub doc_type: String,
  /// Source modification time at indexing (epoch milliseconds).
  pub mtime: i64,
}

impl ChunkRecord {
  /// Stable chunk id: unique across the store for `(path, chunk_index)`.
  pub fn chunk_id(path: &str, chunk_index: u32) -> String {
    format!("{path}#{chunk_index}")
  }
}

/// Persisted file states. `processing` exists only in memory and is never
/// written to the status table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
  Indexed,
  Failed,
  Error,
  Queued,
  Outdated,
}

impl FileStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      FileStatus::Indexed => "indexed",
      FileStatus::Failed => "failed",
      FileStatus::Error => "error",
      FileStatus::Queued => "queued",
      FileStatus::Outdated => "outdated",
    }
  }

  pub fn parse(s: &str) -> Option<FileStatus> {
    match s {
      "indexed" => Some(FileStatus::Indexed),
      "failed" => Some(FileStatus::Failed),
      "error" => Some(FileStatus::Error),
      "queued" => Some(FileStatus::Queued),
      "outdated" => Some(FileStatus::Outdated),
      _ => None,
    }
  }
}

impl std::fmt::Display for FileStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One row of the file-status table. Every field is required at write time;
/// empty strings stand in where a nullable sentinel is needed.
#[derive(Debug, Clone, PartialEq)]
pub struct FileStatusRecord {
  pub path: String,
  pub status: FileStatus,
  /// Decoder version used for the last (attempted) index.
  pub parser_version: u32,
  /// Number of live chunks for this path.
  pub chunk_count: u32,
  /// Empty string when there is no error.
  pub error_message: String,
  /// Source mtime when recorded (epoch milliseconds).
  pub last_modified: i64,
  /// Wall-clock of successful indexing (epoch milliseconds, 0 if never).
  pub indexed_at: i64,
  /// Fast identity token, see [`FileHash`].
  pub file_hash: String,
  /// RFC 3339 wall-clock of the most recent retry attempt, "" if never.
  pub last_retry: String,
}

/// Fast identity token derived from `(size, mtime_ns)`.
///
/// Not a content digest; its sole use is change detection. Any change in size
/// or mtime invalidates the prior index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileHash(String);

impl FileHash {
  pub fn new(size: u64, mtime_ns: u128) -> Self {
    FileHash(format!("{size:x}-{mtime_ns:x}"))
  }

  pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
    let mtime_ns = meta
      .modified()
      .ok()
      .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
      .map(|d| d.as_nanos())
      .unwrap_or(0);
    FileHash::new(meta.len(), mtime_ns)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for FileHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}
