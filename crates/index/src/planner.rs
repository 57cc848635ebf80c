//! Startup re-index planner.
//!
//! Decides which known files need work by comparing stored parser versions
//! against the registry. Reads are projected to `(path, parser_version)` —
//! never full rows — so the planner stays O(indexed files) in memory.

use std::collections::HashMap;
use std::path::Path;

use db::{DbError, Store};
use semadex_core::{FileStatus, FileStatusRecord};
use tracing::{debug, info};

use crate::parsers::ParserRegistry;

/// Work the planner decided on. `outdated` carries full rewritten records
/// (status flipped to `outdated`) for the caller to persist; both lists are
/// pushed to the front of the file queue, outdated first.
#[derive(Debug, Default)]
pub struct PlanOutcome {
  pub outdated: Vec<FileStatusRecord>,
  /// Failed/error paths whose decoder has advanced and deserve a retry.
  pub retries: Vec<String>,
}

impl PlanOutcome {
  pub fn is_empty(&self) -> bool {
    self.outdated.is_empty() && self.retries.is_empty()
  }
}

fn extension_of(path: &str) -> Option<String> {
  Path::new(path)
    .extension()
    .and_then(|e| e.to_str())
    .map(|e| e.to_lowercase())
}

/// Run the planner against the store. Called once at startup, after the
/// status table has been loaded; steady-state work is the scanner's job.
pub async fn plan_reindex(store: &Store, registry: &ParserRegistry) -> Result<PlanOutcome, DbError> {
  let mut outcome = PlanOutcome::default();

  // Projected read: only (path, parser_version) of indexed rows.
  let indexed = store.indexed_parser_versions().await?;

  let mut by_extension: HashMap<String, Vec<(String, u32)>> = HashMap::new();
  for (path, version) in indexed {
    if let Some(ext) = extension_of(&path) {
      by_extension.entry(ext).or_default().push((path, version));
    }
  }

  for (ext, rows) in by_extension {
    let Some(current) = registry.version(&ext) else {
      // Decoder no longer registered; leave rows as they are.
      continue;
    };
    for (path, stored) in rows {
      if stored < current {
        // Full-record rewrite: fetch the row and flip only the status.
        if let Some(record) = store.get_file_status(&path).await? {
          outcome.outdated.push(FileStatusRecord {
            status: FileStatus::Outdated,
            ..record
          });
        }
      }
    }
  }

  // Failed rows ride along when their decoder has advanced.
  for row in store.retryable_failures().await? {
    let Some(ext) = extension_of(&row.path) else { continue };
    if registry.version(&ext).is_some_and(|current| current > row.parser_version) {
      outcome.retries.push(row.path);
    }
  }

  if outcome.is_empty() {
    debug!("Planner found nothing to re-index");
  } else {
    info!(
      outdated = outcome.outdated.len(),
      retries = outcome.retries.len(),
      "Planner queued re-index work"
    );
  }

  Ok(outcome)
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;

  async fn store() -> (TempDir, Store) {
    let dir = TempDir::new().unwrap();
    let (store, _) = Store::open(dir.path(), 8, 6).await.unwrap();
    (dir, store)
  }

  fn record(path: &str, status: FileStatus, parser_version: u32) -> FileStatusRecord {
    FileStatusRecord {
      path: path.to_string(),
      status,
      parser_version,
      chunk_count: 1,
      error_message: String::new(),
      last_modified: 1,
      indexed_at: 2,
      file_hash: "h".to_string(),
      last_retry: String::new(),
    }
  }

  #[tokio::test]
  async fn stale_parser_version_marks_outdated() {
    let (_dir, store) = store().await;
    store
      .upsert_file_status(&record("/docs/old.txt", FileStatus::Indexed, 2))
      .await
      .unwrap();
    store
      .upsert_file_status(&record("/docs/current.txt", FileStatus::Indexed, 4))
      .await
      .unwrap();

    let outcome = plan_reindex(&store, &ParserRegistry::builtin()).await.unwrap();
    assert_eq!(outcome.outdated.len(), 1);
    assert_eq!(outcome.outdated[0].path, "/docs/old.txt");
    assert_eq!(outcome.outdated[0].status, FileStatus::Outdated);
    // The rest of the record is a faithful rewrite.
    assert_eq!(outcome.outdated[0].parser_version, 2);
    assert_eq!(outcome.outdated[0].file_hash, "h");
  }

  #[tokio::test]
  async fn current_rows_are_untouched() {
    let (_dir, store) = store().await;
    store
      .upsert_file_status(&record("/docs/a.txt", FileStatus::Indexed, 4))
      .await
      .unwrap();
    store
      .upsert_file_status(&record("/docs/b.md", FileStatus::Indexed, 4))
      .await
      .unwrap();

    let outcome = plan_reindex(&store, &ParserRegistry::builtin()).await.unwrap();
    assert!(outcome.is_empty());
  }

  #[tokio::test]
  async fn failed_rows_retry_on_parser_upgrade_only() {
    let (_dir, store) = store().await;
    // txt decoder is at version 4: this failure predates it.
    store
      .upsert_file_status(&record("/docs/flaky.txt", FileStatus::Failed, 3))
      .await
      .unwrap();
    // Already failed at the current version: no retry from the planner.
    store
      .upsert_file_status(&record("/docs/still-bad.md", FileStatus::Error, 4))
      .await
      .unwrap();

    let outcome = plan_reindex(&store, &ParserRegistry::builtin()).await.unwrap();
    assert_eq!(outcome.retries, vec!["/docs/flaky.txt".to_string()]);
  }

  #[tokio::test]
  async fn unregistered_extension_is_left_alone() {
    let (_dir, store) = store().await;
    store
      .upsert_file_status(&record("/docs/scan.pdf", FileStatus::Indexed, 2))
      .await
      .unwrap();

    // Builtin registry has no pdf decoder.
    let outcome = plan_reindex(&store, &ParserRegistry::builtin()).await.unwrap();
    assert!(outcome.is_empty());
  }

  #[tokio::test]
  async fn queued_rows_are_not_planner_business() {
    let (_dir, store) = store().await;
    store
      .upsert_file_status(&record("/docs/waiting.txt", FileStatus::Queued, 1))
      .await
      .unwrap();

    let outcome = plan_reindex(&store, &ParserRegistry::builtin()).await.unwrap();
    assert!(outcome.is_empty(), "only indexed/failed/error rows participate");
  }
}
