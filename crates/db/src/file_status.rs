//! File-status table operations.
//!
//! Upserts are full-record rewrites (delete + add, the LanceDB idiom).
//! Planner-facing reads are projected to the few columns they need so the
//! planner stays O(indexed files) in memory, never full rows.

use std::sync::Arc;

use arrow_array::{Int64Array, RecordBatch, RecordBatchIterator, StringArray, UInt32Array};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use semadex_core::{FileStatus, FileStatusRecord};
use tracing::debug;

use crate::{
  connection::{escape_sql, DbError, Result, Store},
  schema::file_status_schema,
};

/// Projected row of a failed/error file, for retry planning.
#[derive(Debug, Clone)]
pub struct FailureRow {
  pub path: String,
  pub parser_version: u32,
  /// RFC 3339 timestamp of the last retry, "" if never.
  pub last_retry: String,
}

impl Store {
  /// Upsert one record. All nine fields are required; partial updates are
  /// expressed as full-record rewrites by the caller.
  #[tracing::instrument(level = "trace", skip(self, record), fields(path = %record.path, status = %record.status))]
  pub async fn upsert_file_status(&self, record: &FileStatusRecord) -> Result<()> {
    if record.path.is_empty() {
      return Err(DbError::InvalidInput("file status path must not be empty".to_string()));
    }

    let table = self.file_status_table().await?;

    // Delete existing entry for this path first
    let _ = table.delete(&format!("path = '{}'", escape_sql(&record.path))).await;

    let batch = record_to_batch(record)?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], file_status_schema());
    table.add(Box::new(batches)).execute().await?;
    Ok(())
  }

  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn delete_file_status(&self, path: &str) -> Result<()> {
    let table = self.file_status_table().await?;
    table.delete(&format!("path = '{}'", escape_sql(path))).await?;
    Ok(())
  }

  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn get_file_status(&self, path: &str) -> Result<Option<FileStatusRecord>> {
    let table = self.file_status_table().await?;
    let results: Vec<RecordBatch> = table
      .query()
      .only_if(format!("path = '{}'", escape_sql(path)))
      .execute()
      .await?
      .try_collect()
      .await?;

    for batch in &results {
      if batch.num_rows() > 0 {
        return Ok(Some(batch_to_record(batch, 0)?));
      }
    }
    Ok(None)
  }

  /// `(path, parser_version)` of every `indexed` row. Projected read used by
  /// the re-index planner at startup.
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn indexed_parser_versions(&self) -> Result<Vec<(String, u32)>> {
    let table = self.file_status_table().await?;
    let results: Vec<RecordBatch> = table
      .query()
      .only_if("status = 'indexed'")
      .select(Select::Columns(vec!["path".to_string(), "parser_version".to_string()]))
      .execute()
      .await?
      .try_collect()
      .await?;

    let mut rows = Vec::new();
    for batch in results {
      let paths = batch
        .column_by_name("path")
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| DbError::NotFound("path column".to_string()))?;
      let versions = batch
        .column_by_name("parser_version")
        .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
        .ok_or_else(|| DbError::NotFound("parser_version column".to_string()))?;
      for i in 0..batch.num_rows() {
        rows.push((paths.value(i).to_string(), versions.value(i)));
      }
    }
    debug!(rows = rows.len(), "Loaded indexed parser versions");
    Ok(rows)
  }

  /// Projected `failed`/`error` rows for retry planning.
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn retryable_failures(&self) -> Result<Vec<FailureRow>> {
    let table = self.file_status_table().await?;
    let results: Vec<RecordBatch> = table
      .query()
      .only_if("status = 'failed' OR status = 'error'")
      .select(Select::Columns(vec![
        "path".to_string(),
        "parser_version".to_string(),
        "last_retry".to_string(),
      ]))
      .execute()
      .await?
      .try_collect()
      .await?;

    let mut rows = Vec::new();
    for batch in results {
      let paths = batch
        .column_by_name("path")
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| DbError::NotFound("path column".to_string()))?;
      let versions = batch
        .column_by_name("parser_version")
        .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
        .ok_or_else(|| DbError::NotFound("parser_version column".to_string()))?;
      let retries = batch
        .column_by_name("last_retry")
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| DbError::NotFound("last_retry column".to_string()))?;
      for i in 0..batch.num_rows() {
        rows.push(FailureRow {
          path: paths.value(i).to_string(),
          parser_version: versions.value(i),
          last_retry: retries.value(i).to_string(),
        });
      }
    }
    Ok(rows)
  }

  /// Full table load for the startup `db_load` stage cache.
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn load_all_statuses(&self) -> Result<Vec<FileStatusRecord>> {
    let table = self.file_status_table().await?;
    let results: Vec<RecordBatch> = table.query().execute().await?.try_collect().await?;

    let mut records = Vec::new();
    for batch in results {
      for i in 0..batch.num_rows() {
        records.push(batch_to_record(&batch, i)?);
      }
    }
    debug!(records = records.len(), "Loaded file status table");
    Ok(records)
  }

  pub async fn count_file_statuses(&self) -> Result<usize> {
    let table = self.file_status_table().await?;
    Ok(table.count_rows(None).await?)
  }
}

/// Convert a FileStatusRecord to an Arrow RecordBatch
fn record_to_batch(record: &FileStatusRecord) -> Result<RecordBatch> {
  let batch = RecordBatch::try_new(
    file_status_schema(),
    vec![
      Arc::new(StringArray::from(vec![record.path.clone()])),
      Arc::new(StringArray::from(vec![record.status.as_str().to_string()])),
      Arc::new(UInt32Array::from(vec![record.parser_version])),
      Arc::new(UInt32Array::from(vec![record.chunk_count])),
      Arc::new(StringArray::from(vec![record.error_message.clone()])),
      Arc::new(Int64Array::from(vec![record.last_modified])),
      Arc::new(Int64Array::from(vec![record.indexed_at])),
      Arc::new(StringArray::from(vec![record.file_hash.clone()])),
      Arc::new(StringArray::from(vec![record.last_retry.clone()])),
    ],
  )?;
  Ok(batch)
}

fn string_column(batch: &RecordBatch, name: &str, row: usize) -> Result<String> {
  batch
    .column_by_name(name)
    .and_then(|c| c.as_any().downcast_ref::<StringArray>())
    .map(|a| a.value(row).to_string())
    .ok_or_else(|| DbError::NotFound(format!("{name} column")))
}

fn u32_column(batch: &RecordBatch, name: &str, row: usize) -> Result<u32> {
  batch
    .column_by_name(name)
    .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
    .map(|a| a.value(row))
    .ok_or_else(|| DbError::NotFound(format!("{name} column")))
}

fn i64_column(batch: &RecordBatch, name: &str, row: usize) -> Result<i64> {
  batch
    .column_by_name(name)
    .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
    .map(|a| a.value(row))
    .ok_or_else(|| DbError::NotFound(format!("{name} column")))
}

/// Convert a RecordBatch row to a FileStatusRecord
fn batch_to_record(batch: &RecordBatch, row: usize) -> Result<FileStatusRecord> {
  let status_raw = string_column(batch, "status", row)?;
  let status = FileStatus::parse(&status_raw)
    .ok_or_else(|| DbError::Query(format!("unknown status value '{status_raw}'")))?;

  Ok(FileStatusRecord {
    path: string_column(batch, "path", row)?,
    status,
    parser_version: u32_column(batch, "parser_version", row)?,
    chunk_count: u32_column(batch, "chunk_count", row)?,
    error_message: string_column(batch, "error_message", row)?,
    last_modified: i64_column(batch, "last_modified", row)?,
    indexed_at: i64_column(batch, "indexed_at", row)?,
    file_hash: string_column(batch, "file_hash", row)?,
    last_retry: string_column(batch, "last_retry", row)?,
  })
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;

  async fn test_store() -> (TempDir, Store) {
    let dir = TempDir::new().unwrap();
    let (store, _) = Store::open(dir.path(), 8, 6).await.unwrap();
    (dir, store)
  }

  fn record(path: &str, status: FileStatus, parser_version: u32) -> FileStatusRecord {
    FileStatusRecord {
      path: path.to_string(),
      status,
      parser_version,
      chunk_count: 3,
      error_message: String::new(),
      last_modified: 1_700_000_000_000,
      indexed_at: 1_700_000_100_000,
      file_hash: "1a2b-3c4d".to_string(),
      last_retry: String::new(),
    }
  }

  #[tokio::test]
  async fn upsert_replaces_prior_record() {
    let (_dir, store) = test_store().await;
    store
      .upsert_file_status(&record("/docs/a.txt", FileStatus::Queued, 4))
      .await
      .unwrap();
    store
      .upsert_file_status(&record("/docs/a.txt", FileStatus::Indexed, 4))
      .await
      .unwrap();

    assert_eq!(store.count_file_statuses().await.unwrap(), 1, "upsert must not duplicate");
    let loaded = store.get_file_status("/docs/a.txt").await.unwrap().unwrap();
    assert_eq!(loaded.status, FileStatus::Indexed);
  }

  #[tokio::test]
  async fn all_nine_fields_round_trip() {
    let (_dir, store) = test_store().await;
    let mut rec = record("/docs/report.pdf", FileStatus::Failed, 2);
    rec.error_message = "no text content".to_string();
    rec.last_retry = "2026-08-01T10:00:00Z".to_string();
    store.upsert_file_status(&rec).await.unwrap();

    let loaded = store.get_file_status("/docs/report.pdf").await.unwrap().unwrap();
    assert_eq!(loaded, rec);
  }

  #[tokio::test]
  async fn indexed_projection_filters_by_status() {
    let (_dir, store) = test_store().await;
    store
      .upsert_file_status(&record("/docs/a.txt", FileStatus::Indexed, 4))
      .await
      .unwrap();
    store
      .upsert_file_status(&record("/docs/b.pdf", FileStatus::Indexed, 2))
      .await
      .unwrap();
    store
      .upsert_file_status(&record("/docs/c.md", FileStatus::Failed, 4))
      .await
      .unwrap();

    let mut rows = store.indexed_parser_versions().await.unwrap();
    rows.sort();
    assert_eq!(
      rows,
      vec![("/docs/a.txt".to_string(), 4), ("/docs/b.pdf".to_string(), 2)]
    );
  }

  #[tokio::test]
  async fn retryable_failures_cover_both_failure_states() {
    let (_dir, store) = test_store().await;
    store
      .upsert_file_status(&record("/docs/a.txt", FileStatus::Indexed, 4))
      .await
      .unwrap();
    let mut failed = record("/docs/bad.rtf", FileStatus::Failed, 1);
    failed.last_retry = "2026-07-01T00:00:00Z".to_string();
    store.upsert_file_status(&failed).await.unwrap();
    store
      .upsert_file_status(&record("/docs/worse.csv", FileStatus::Error, 2))
      .await
      .unwrap();

    let mut rows = store.retryable_failures().await.unwrap();
    rows.sort_by(|a, b| a.path.cmp(&b.path));
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].path, "/docs/bad.rtf");
    assert_eq!(rows[0].last_retry, "2026-07-01T00:00:00Z");
    assert_eq!(rows[1].path, "/docs/worse.csv");
    assert_eq!(rows[1].last_retry, "");
  }

  #[tokio::test]
  async fn delete_then_duplicate_delete_is_noop() {
    let (_dir, store) = test_store().await;
    store
      .upsert_file_status(&record("/docs/a.txt", FileStatus::Indexed, 4))
      .await
      .unwrap();
    store.delete_file_status("/docs/a.txt").await.unwrap();
    store.delete_file_status("/docs/a.txt").await.unwrap();
    assert!(store.get_file_status("/docs/a.txt").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn paths_with_quotes_are_escaped() {
    let (_dir, store) = test_store().await;
    let path = "/docs/it's a file.txt";
    store
      .upsert_file_status(&record(path, FileStatus::Indexed, 4))
      .await
      .unwrap();
    let loaded = store.get_file_status(path).await.unwrap();
    assert!(loaded.is_some());
    store.delete_file_status(path).await.unwrap();
    assert!(store.get_file_status(path).await.unwrap().is_none());
  }
}
