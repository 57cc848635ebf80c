//! Serialized store writes.
//!
//! All table mutation flows through one bounded queue owned by a single
//! writer task, giving per-table FIFO semantics without any extra lock
//! layer. Queue depth above the threshold signals back-pressure upstream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use semadex_core::{ChunkRecord, FileStatus, FileStatusRecord};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::{status_cache::CachedStatus, Store, StatusCache};

#[derive(Debug, Clone)]
pub struct WriterConfig {
  pub capacity: usize,
  pub backpressure_threshold: usize,
}

impl Default for WriterConfig {
  fn default() -> Self {
    Self {
      capacity: 256,
      backpressure_threshold: 128,
    }
  }
}

/// Queue depth gauge with a back-pressure threshold.
///
/// Also used by the pipeline for the embedding queue: an item counts from
/// enqueue until it has been fully handled downstream, so `wait_empty`
/// doubles as a drain barrier.
#[derive(Debug)]
pub struct DepthGauge {
  depth: AtomicUsize,
  threshold: usize,
  notify: Notify,
}

impl DepthGauge {
  pub fn new(threshold: usize) -> Arc<Self> {
    Arc::new(Self {
      depth: AtomicUsize::new(0),
      threshold,
      notify: Notify::new(),
    })
  }

  pub fn inc(&self) -> usize {
    self.depth.fetch_add(1, Ordering::AcqRel) + 1
  }

  pub fn dec(&self) {
    let prev = self.depth.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(prev > 0, "gauge underflow");
    self.notify.notify_waiters();
  }

  pub fn current(&self) -> usize {
    self.depth.load(Ordering::Acquire)
  }

  pub fn is_backpressured(&self) -> bool {
    self.current() >= self.threshold
  }

  /// Wait until depth drops below the back-pressure threshold.
  pub async fn wait_below_threshold(&self) {
    loop {
      // Register before checking so a concurrent dec is not lost.
      let notified = self.notify.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      if self.current() < self.threshold {
        return;
      }
      notified.await;
    }
  }

  /// Wait until the queue is fully drained.
  pub async fn wait_empty(&self) {
    loop {
      let notified = self.notify.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      if self.current() == 0 {
        return;
      }
      notified.await;
    }
  }
}

/// One serialized store mutation.
pub enum WriteOp {
  /// Delete-old-then-insert-new for one path, then flip its status. A single
  /// logical operation: the status never reads `indexed` before the chunk
  /// rows it counts exist.
  ReplaceChunks {
    path: String,
    chunks: Vec<ChunkRecord>,
    vectors: Vec<Vec<f32>>,
    status: FileStatusRecord,
  },
  /// Full-record status rewrite without touching chunks.
  MarkStatus { record: FileStatusRecord },
  /// Cascade delete: chunks and status for one path.
  RemovePath { path: String },
  /// Ack once every previously queued op has been applied.
  Flush { ack: oneshot::Sender<()> },
}

#[derive(Clone)]
pub struct WriteHandle {
  tx: mpsc::Sender<WriteOp>,
  gauge: Arc<DepthGauge>,
}

impl WriteHandle {
  pub async fn replace_chunks(
    &self,
    path: String,
    chunks: Vec<ChunkRecord>,
    vectors: Vec<Vec<f32>>,
    status: FileStatusRecord,
  ) {
    self
      .send(WriteOp::ReplaceChunks {
        path,
        chunks,
        vectors,
        status,
      })
      .await;
  }

  pub async fn mark_status(&self, record: FileStatusRecord) {
    self.send(WriteOp::MarkStatus { record }).await;
  }

  pub async fn remove_path(&self, path: String) {
    self.send(WriteOp::RemovePath { path }).await;
  }

  /// Wait until every op queued before this call has been applied.
  pub async fn flush(&self) {
    let (ack, done) = oneshot::channel();
    self.send(WriteOp::Flush { ack }).await;
    let _ = done.await;
  }

  pub fn gauge(&self) -> Arc<DepthGauge> {
    self.gauge.clone()
  }

  async fn send(&self, op: WriteOp) {
    self.gauge.inc();
    if self.tx.send(op).await.is_err() {
      self.gauge.dec();
      warn!("Store writer is gone, dropping write op");
    }
  }
}

/// Spawn the owning writer task. The store closes when every `WriteHandle`
/// clone is dropped and the returned handle is awaited.
pub fn spawn_store_writer(
  store: Arc<Store>,
  cache: Arc<StatusCache>,
  config: WriterConfig,
) -> (WriteHandle, JoinHandle<()>) {
  let (tx, mut rx) = mpsc::channel::<WriteOp>(config.capacity);
  let gauge = DepthGauge::new(config.backpressure_threshold);

  let task_gauge = gauge.clone();
  let handle = tokio::spawn(async move {
    debug!("Store writer starting");
    while let Some(op) = rx.recv().await {
      apply(&store, &cache, op).await;
      task_gauge.dec();
    }
    debug!("Store writer complete");
  });

  (WriteHandle { tx, gauge }, handle)
}

async fn apply(store: &Store, cache: &StatusCache, op: WriteOp) {
  match op {
    WriteOp::ReplaceChunks {
      path,
      chunks,
      vectors,
      status,
    } => {
      if let Err(e) = store.delete_chunks_for_path(&path).await {
        warn!(path = %path, error = %e, "Failed to delete existing chunks");
      }
      if let Err(e) = store.add_chunks(&chunks, &vectors).await {
        // Fatal for this batch; the pipeline continues with other files.
        error!(path = %path, error = %e, "Failed to write chunks");
        let failed = FileStatusRecord {
          status: FileStatus::Error,
          error_message: format!("write failed: {e}"),
          chunk_count: 0,
          ..status
        };
        write_status(store, cache, failed).await;
        return;
      }
      trace!(path = %path, chunks = chunks.len(), "Chunks replaced");
      write_status(store, cache, status).await;
    }
    WriteOp::MarkStatus { record } => {
      write_status(store, cache, record).await;
    }
    WriteOp::RemovePath { path } => {
      if let Err(e) = store.delete_chunks_for_path(&path).await {
        warn!(path = %path, error = %e, "Failed to delete chunks for removed file");
      }
      if let Err(e) = store.delete_file_status(&path).await {
        warn!(path = %path, error = %e, "Failed to delete status for removed file");
      }
      cache.remove(&path).await;
    }
    WriteOp::Flush { ack } => {
      let _ = ack.send(());
    }
  }
}

async fn write_status(store: &Store, cache: &StatusCache, record: FileStatusRecord) {
  match store.upsert_file_status(&record).await {
    Ok(()) => {
      cache.insert(&record.path, CachedStatus::from(&record)).await;
    }
    Err(e) => error!(path = %record.path, error = %e, "Failed to upsert file status"),
  }
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;

  const DIM: usize = 8;

  async fn setup() -> (TempDir, Arc<Store>, Arc<StatusCache>, WriteHandle, JoinHandle<()>) {
    let dir = TempDir::new().unwrap();
    let (store, _) = Store::open(dir.path(), DIM, 6).await.unwrap();
    let store = Arc::new(store);
    let cache = Arc::new(StatusCache::new());
    let (handle, join) = spawn_store_writer(store.clone(), cache.clone(), WriterConfig::default());
    (dir, store, cache, handle, join)
  }

  fn chunk(path: &str, index: u32, text: &str) -> ChunkRecord {
    ChunkRecord {
      id: ChunkRecord::chunk_id(path, index),
      path: path.to_string(),
      chunk_index: index,
      page: 0,
      offset: 0,
      text: text.to_string(),
      title: "doc".to_string(),
      doc_type: "txt".to_string(),
      mtime: 0,
    }
  }

  fn indexed_status(path: &str, chunk_count: u32) -> FileStatusRecord {
    FileStatusRecord {
      path: path.to_string(),
      status: FileStatus::Indexed,
      parser_version: 4,
      chunk_count,
      error_message: String::new(),
      last_modified: 1,
      indexed_at: 2,
      file_hash: "h".to_string(),
      last_retry: String::new(),
    }
  }

  #[tokio::test]
  async fn replace_chunks_writes_rows_and_status() {
    let (_dir, store, cache, handle, join) = setup().await;
    let path = "/docs/a.txt";

    handle
      .replace_chunks(
        path.to_string(),
        vec![chunk(path, 0, "hello")],
        vec![vec![1.0; DIM]],
        indexed_status(path, 1),
      )
      .await;
    handle.flush().await;

    assert_eq!(store.chunks_for_path(path).await.unwrap().len(), 1);
    let status = store.get_file_status(path).await.unwrap().unwrap();
    assert_eq!(status.status, FileStatus::Indexed);
    assert_eq!(cache.get(path).await.unwrap().status, FileStatus::Indexed);

    drop(handle);
    join.await.unwrap();
  }

  #[tokio::test]
  async fn replace_deletes_prior_generation() {
    let (_dir, store, _cache, handle, join) = setup().await;
    let path = "/docs/a.txt";

    handle
      .replace_chunks(
        path.to_string(),
        vec![chunk(path, 0, "old one"), chunk(path, 1, "old two")],
        vec![vec![1.0; DIM], vec![1.0; DIM]],
        indexed_status(path, 2),
      )
      .await;
    handle
      .replace_chunks(
        path.to_string(),
        vec![chunk(path, 0, "new")],
        vec![vec![1.0; DIM]],
        indexed_status(path, 1),
      )
      .await;
    handle.flush().await;

    let rows = store.chunks_for_path(path).await.unwrap();
    assert_eq!(rows.len(), 1, "no chunks from the previous index may remain");
    assert_eq!(rows[0].text, "new");

    drop(handle);
    join.await.unwrap();
  }

  #[tokio::test]
  async fn remove_path_cascades() {
    let (_dir, store, cache, handle, join) = setup().await;
    let path = "/docs/a.txt";

    handle
      .replace_chunks(
        path.to_string(),
        vec![chunk(path, 0, "hello")],
        vec![vec![1.0; DIM]],
        indexed_status(path, 1),
      )
      .await;
    handle.remove_path(path.to_string()).await;
    // Duplicate unlink must be a no-op.
    handle.remove_path(path.to_string()).await;
    handle.flush().await;

    assert!(store.chunks_for_path(path).await.unwrap().is_empty());
    assert!(store.get_file_status(path).await.unwrap().is_none());
    assert!(cache.get(path).await.is_none());

    drop(handle);
    join.await.unwrap();
  }

  #[tokio::test]
  async fn failed_chunk_write_marks_file_error() {
    let (_dir, store, _cache, handle, join) = setup().await;
    let path = "/docs/a.txt";

    // Wrong vector dimension forces the chunk write to fail.
    handle
      .replace_chunks(
        path.to_string(),
        vec![chunk(path, 0, "hello")],
        vec![vec![1.0; DIM + 1]],
        indexed_status(path, 1),
      )
      .await;
    handle.flush().await;

    let status = store.get_file_status(path).await.unwrap().unwrap();
    assert_eq!(status.status, FileStatus::Error);
    assert!(status.error_message.contains("write failed"));
    assert!(
      store.chunks_for_path(path).await.unwrap().is_empty(),
      "status must never read indexed without its chunk rows"
    );

    drop(handle);
    join.await.unwrap();
  }

  #[tokio::test]
  async fn gauge_tracks_depth() {
    let gauge = DepthGauge::new(2);
    assert!(!gauge.is_backpressured());
    gauge.inc();
    gauge.inc();
    assert!(gauge.is_backpressured());
    gauge.dec();
    assert!(!gauge.is_backpressured());
    gauge.dec();
    gauge.wait_empty().await;
  }
}
