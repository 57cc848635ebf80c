use std::path::{Path, PathBuf};

use lancedb::{connect, Connection};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
  schema::{chunks_schema, file_status_schema},
  version,
};

#[derive(Error, Debug)]
pub enum DbError {
  #[error("LanceDB error: {0}")]
  Lance(#[from] lancedb::Error),
  #[error("Arrow error: {0}")]
  Arrow(#[from] arrow::error::ArrowError),
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Not found: {0}")]
  NotFound(String),
  #[error("Invalid input: {0}")]
  InvalidInput(String),
  #[error("Database query error: {0}")]
  Query(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Connection to the on-disk vector and status tables.
///
/// The store exclusively owns the table directories; mutation goes through
/// the serialized write queue (see `write_queue`).
pub struct Store {
  pub connection: Connection,
  pub vector_dim: usize,
  pub data_root: PathBuf,
}

impl Store {
  /// Open or create the store at `data_root`, running the schema version
  /// gate first. Returns the store and whether the on-disk state was erased
  /// and rebuilt.
  pub async fn open(data_root: &Path, vector_dim: usize, db_version: u32) -> Result<(Self, bool)> {
    tokio::fs::create_dir_all(data_root).await?;

    let rebuilt = version::ensure_schema_version(data_root, db_version).await?;

    info!(path = %data_root.display(), vector_dim, rebuilt, "Opening store");
    let connection = match connect(data_root.to_string_lossy().as_ref()).execute().await {
      Ok(conn) => conn,
      Err(e) => {
        error!(path = %data_root.display(), err = %e, "Failed to open store");
        return Err(e.into());
      }
    };

    let store = Self {
      connection,
      vector_dim,
      data_root: data_root.to_path_buf(),
    };

    store.ensure_tables().await?;
    version::write_marker(data_root, db_version).await?;

    Ok((store, rebuilt))
  }

  /// Ensure both tables exist
  async fn ensure_tables(&self) -> Result<()> {
    let table_names = self.connection.table_names().execute().await?;
    debug!(existing_tables = table_names.len(), "Checking required tables");

    if !table_names.contains(&"chunks".to_string()) {
      debug!("Creating chunks table");
      self
        .connection
        .create_empty_table("chunks", chunks_schema(self.vector_dim))
        .execute()
        .await?;
    }

    if !table_names.contains(&"file_status".to_string()) {
      debug!("Creating file_status table");
      self
        .connection
        .create_empty_table("file_status", file_status_schema())
        .execute()
        .await?;
    }

    Ok(())
  }

  /// Get the chunks table
  pub async fn chunks_table(&self) -> Result<lancedb::Table> {
    Ok(self.connection.open_table("chunks").execute().await?)
  }

  /// Get the file_status table
  pub async fn file_status_table(&self) -> Result<lancedb::Table> {
    Ok(self.connection.open_table("file_status").execute().await?)
  }
}

/// Escape single quotes in SQL strings
pub(crate) fn escape_sql(s: &str) -> String {
  s.replace('\'', "''")
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;
  use crate::version::{read_marker, VERSION_MARKER};

  #[tokio::test]
  async fn open_creates_tables_and_marker() {
    let dir = TempDir::new().unwrap();
    let (store, rebuilt) = Store::open(dir.path(), 768, 6).await.unwrap();
    assert!(rebuilt, "first open counts as a rebuild");

    let tables = store.connection.table_names().execute().await.unwrap();
    assert!(tables.contains(&"chunks".to_string()), "chunks table should exist");
    assert!(
      tables.contains(&"file_status".to_string()),
      "file_status table should exist"
    );
    assert_eq!(read_marker(dir.path()), Some(6));
  }

  #[tokio::test]
  async fn reopen_at_same_version_is_idempotent() {
    let dir = TempDir::new().unwrap();
    {
      let (_store, _) = Store::open(dir.path(), 768, 6).await.unwrap();
    }
    let (_store, rebuilt) = Store::open(dir.path(), 768, 6).await.unwrap();
    assert!(!rebuilt, "matching marker must not rebuild");
    assert_eq!(read_marker(dir.path()), Some(6));
  }

  #[tokio::test]
  async fn version_bump_rebuilds_store() {
    let dir = TempDir::new().unwrap();
    {
      let (_store, _) = Store::open(dir.path(), 768, 5).await.unwrap();
    }
    assert_eq!(read_marker(dir.path()), Some(5));

    let (store, rebuilt) = Store::open(dir.path(), 768, 6).await.unwrap();
    assert!(rebuilt);
    assert_eq!(read_marker(dir.path()), Some(6));

    // The rebuilt file_status table must be empty.
    let table = store.file_status_table().await.unwrap();
    assert_eq!(table.count_rows(None).await.unwrap(), 0);
  }

  #[tokio::test]
  async fn corrupt_marker_rebuilds_store() {
    let dir = TempDir::new().unwrap();
    {
      let (_store, _) = Store::open(dir.path(), 768, 6).await.unwrap();
    }
    std::fs::write(dir.path().join(VERSION_MARKER), "garbage").unwrap();

    let (_store, rebuilt) = Store::open(dir.path(), 768, 6).await.unwrap();
    assert!(rebuilt);
    assert_eq!(read_marker(dir.path()), Some(6));
  }
}
