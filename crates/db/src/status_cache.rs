//! In-memory mirror of the file-status table.
//!
//! Single writer (the store writer task) plus many readers: the planner,
//! scanner reconciliation and the pipeline's hash short-circuit. Writers take
//! a short-held exclusive lock; readers take shared locks.

use std::collections::HashMap;

use semadex_core::{FileStatus, FileStatusRecord};
use tokio::sync::RwLock;

/// The slice of a status record the hot paths need.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedStatus {
  pub status: FileStatus,
  pub parser_version: u32,
  pub file_hash: String,
  /// RFC 3339 time of the most recent failed attempt, "" if none.
  pub last_retry: String,
}

impl From<&FileStatusRecord> for CachedStatus {
  fn from(record: &FileStatusRecord) -> Self {
    Self {
      status: record.status,
      parser_version: record.parser_version,
      file_hash: record.file_hash.clone(),
      last_retry: record.last_retry.clone(),
    }
  }
}

#[derive(Debug, Default)]
pub struct StatusCache {
  inner: RwLock<HashMap<String, CachedStatus>>,
}

impl StatusCache {
  pub fn new() -> Self {
    Self::default()
  }

  /// Replace the whole cache from a table load (startup `db_load`).
  pub async fn replace_all(&self, records: &[FileStatusRecord]) {
    let mut map = HashMap::with_capacity(records.len());
    for record in records {
      map.insert(record.path.clone(), CachedStatus::from(record));
    }
    *self.inner.write().await = map;
  }

  pub async fn get(&self, path: &str) -> Option<CachedStatus> {
    self.inner.read().await.get(path).cloned()
  }

  pub async fn insert(&self, path: &str, status: CachedStatus) {
    self.inner.write().await.insert(path.to_string(), status);
  }

  pub async fn remove(&self, path: &str) {
    self.inner.write().await.remove(path);
  }

  /// Snapshot of every known path, for scan reconciliation.
  pub async fn paths(&self) -> Vec<String> {
    self.inner.read().await.keys().cloned().collect()
  }

  pub async fn len(&self) -> usize {
    self.inner.read().await.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.inner.read().await.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record(path: &str, status: FileStatus) -> FileStatusRecord {
    FileStatusRecord {
      path: path.to_string(),
      status,
      parser_version: 4,
      chunk_count: 1,
      error_message: String::new(),
      last_modified: 0,
      indexed_at: 0,
      file_hash: "abc-def".to_string(),
      last_retry: String::new(),
    }
  }

  #[tokio::test]
  async fn replace_all_swaps_contents() {
    let cache = StatusCache::new();
    cache.insert("/old", CachedStatus::from(&record("/old", FileStatus::Queued))).await;

    cache
      .replace_all(&[record("/a", FileStatus::Indexed), record("/b", FileStatus::Failed)])
      .await;

    assert_eq!(cache.len().await, 2);
    assert!(cache.get("/old").await.is_none());
    assert_eq!(cache.get("/a").await.unwrap().status, FileStatus::Indexed);
  }

  #[tokio::test]
  async fn remove_is_idempotent() {
    let cache = StatusCache::new();
    cache.insert("/a", CachedStatus::from(&record("/a", FileStatus::Indexed))).await;
    cache.remove("/a").await;
    cache.remove("/a").await;
    assert!(cache.is_empty().await);
  }
}
