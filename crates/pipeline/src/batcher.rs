//! Embedding batcher: strict-FIFO batches of up to 32 chunks, one `embed`
//! call each, vectors paired to chunks by input order.
//!
//! Every chunk keeps the path it arrived with; rows are keyed to that path
//! when a file's assembly completes. A chunk from file A can never be
//! written under file B's path, even when their chunks share a batch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use db::{DepthGauge, WriteHandle};
use embedding::Embedder;
use index::TextChunk;
use semadex_core::{ChunkRecord, FileStatus, FileStatusRecord};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{worker::EmbedItem, Tombstones};

#[derive(Debug, Clone)]
pub struct BatcherConfig {
  /// Maximum chunks per embed call.
  pub batch_size: usize,
  /// Attempts per batch, including the first (1 + 2 retries).
  pub max_attempts: u32,
  /// Linear backoff unit between attempts.
  pub retry_backoff: Duration,
  /// How long to wait for more chunks before dispatching a partial batch.
  pub idle_flush: Duration,
}

impl Default for BatcherConfig {
  fn default() -> Self {
    Self {
      batch_size: 32,
      max_attempts: 3,
      retry_backoff: Duration::from_secs(1),
      idle_flush: Duration::from_millis(200),
    }
  }
}

/// Chunks of one file accumulated until all of them have vectors.
struct FileAssembly {
  expected: u32,
  title: String,
  doc_type: String,
  mtime_ms: i64,
  parser_version: u32,
  file_hash: String,
  rows: Vec<(TextChunk, Vec<f32>)>,
}

impl FileAssembly {
  fn from_item(item: &EmbedItem) -> Self {
    Self {
      expected: item.total_chunks,
      title: item.title.clone(),
      doc_type: item.doc_type.clone(),
      mtime_ms: item.mtime_ms,
      parser_version: item.parser_version,
      file_hash: item.file_hash.clone(),
      rows: Vec::with_capacity(item.total_chunks as usize),
    }
  }

  fn is_complete(&self) -> bool {
    self.rows.len() as u32 >= self.expected
  }
}

pub async fn embed_batcher(
  mut rx: mpsc::Receiver<EmbedItem>,
  gauge: Arc<DepthGauge>,
  embedder: Arc<dyn Embedder>,
  writer: WriteHandle,
  tombstones: Arc<Tombstones>,
  config: BatcherConfig,
  cancel: CancellationToken,
) {
  debug!(batch_size = config.batch_size, "Embed batcher starting");

  let mut assemblies: HashMap<String, FileAssembly> = HashMap::new();
  // Files whose batch failed; their straggler chunks are dropped until a
  // fresh pass (chunk 0) arrives.
  let mut poisoned: HashSet<String> = HashSet::new();

  loop {
    let first = tokio::select! {
      biased;
      _ = cancel.cancelled() => break,
      item = rx.recv() => match item {
        Some(item) => item,
        None => break,
      },
    };

    let mut batch = vec![first];
    while batch.len() < config.batch_size {
      match tokio::time::timeout(config.idle_flush, rx.recv()).await {
        Ok(Some(item)) => batch.push(item),
        Ok(None) | Err(_) => break,
      }
    }

    dispatch_batch(
      batch,
      &mut assemblies,
      &mut poisoned,
      &gauge,
      embedder.as_ref(),
      &writer,
      &tombstones,
      &config,
    )
    .await;
  }

  // Incomplete assemblies stay pre-terminal; their files re-enter the queue
  // on the next startup.
  if !assemblies.is_empty() {
    debug!(
      incomplete = assemblies.len(),
      "Batcher exiting with incomplete files (will re-index next run)"
    );
  }
  debug!("Embed batcher complete");
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_batch(
  batch: Vec<EmbedItem>,
  assemblies: &mut HashMap<String, FileAssembly>,
  poisoned: &mut HashSet<String>,
  gauge: &DepthGauge,
  embedder: &dyn Embedder,
  writer: &WriteHandle,
  tombstones: &Tombstones,
  config: &BatcherConfig,
) {
  let batch_len = batch.len();

  // Write-queue back-pressure pauses dispatching.
  writer.gauge().wait_below_threshold().await;

  // A chunk 0 means its file started a fresh pass; poison no longer applies.
  for item in &batch {
    if item.chunk.index == 0 {
      poisoned.remove(&item.path);
    }
  }

  let live: Vec<EmbedItem> = batch
    .into_iter()
    .filter(|item| {
      if tombstones.contains(&item.path) {
        assemblies.remove(&item.path);
        return false;
      }
      !poisoned.contains(&item.path)
    })
    .collect();

  if live.is_empty() {
    for _ in 0..batch_len {
      gauge.dec();
    }
    return;
  }

  let texts: Vec<String> = live.iter().map(|item| item.chunk.text.clone()).collect();

  let mut attempt = 1u32;
  let vectors = loop {
    match embedder.embed(&texts, true).await {
      Ok(vectors) if vectors.len() == texts.len() => break Some(vectors),
      Ok(vectors) => {
        warn!(
          expected = texts.len(),
          got = vectors.len(),
          "Embedder returned wrong vector count"
        );
        break None;
      }
      Err(e) if attempt < config.max_attempts => {
        warn!(attempt, error = %e, "Embed batch failed, retrying");
        tokio::time::sleep(config.retry_backoff * attempt).await;
        attempt += 1;
      }
      Err(e) => {
        warn!(error = %e, "Embed batch failed after retries");
        break None;
      }
    }
  };

  match vectors {
    Some(vectors) => {
      // Strict positional pairing: the embedder returns vectors in request
      // order and performs no re-sorting.
      for (item, vector) in live.into_iter().zip(vectors) {
        let path = item.path.clone();
        let assembly = assemblies
          .entry(path.clone())
          .or_insert_with(|| FileAssembly::from_item(&item));
        assembly.rows.push((item.chunk, vector));

        if assembly.is_complete() {
          let assembly = assemblies.remove(&path).expect("assembly present");
          if tombstones.contains(&path) {
            trace!(path = %path, "Dropping completed assembly for unlinked file");
            continue;
          }
          flush_file(&path, assembly, writer).await;
        }
      }
    }
    None => {
      // Per-file failure semantics: every file with a chunk in this batch
      // flips to `error`; their assemblies are dropped.
      let mut failed: HashMap<String, &EmbedItem> = HashMap::new();
      for item in &live {
        failed.entry(item.path.clone()).or_insert(item);
      }
      for (path, item) in failed {
        assemblies.remove(&path);
        poisoned.insert(path.clone());
        writer
          .mark_status(FileStatusRecord {
            path,
            status: FileStatus::Error,
            parser_version: item.parser_version,
            chunk_count: 0,
            error_message: "embedding failed".to_string(),
            last_modified: item.mtime_ms,
            indexed_at: 0,
            file_hash: item.file_hash.clone(),
            last_retry: Utc::now().to_rfc3339(),
          })
          .await;
      }
    }
  }

  for _ in 0..batch_len {
    gauge.dec();
  }
}

async fn flush_file(path: &str, assembly: FileAssembly, writer: &WriteHandle) {
  let mut chunks = Vec::with_capacity(assembly.rows.len());
  let mut vectors = Vec::with_capacity(assembly.rows.len());

  for (chunk, vector) in assembly.rows {
    chunks.push(ChunkRecord {
      id: ChunkRecord::chunk_id(path, chunk.index),
      path: path.to_string(),
      chunk_index: chunk.index,
      page: chunk.page,
      offset: chunk.offset,
      text: chunk.text,
      title: assembly.title.clone(),
      doc_type: assembly.doc_type.clone(),
      mtime: assembly.mtime_ms,
    });
    vectors.push(vector);
  }

  let status = FileStatusRecord {
    path: path.to_string(),
    status: FileStatus::Indexed,
    parser_version: assembly.parser_version,
    chunk_count: chunks.len() as u32,
    error_message: String::new(),
    last_modified: assembly.mtime_ms,
    indexed_at: Utc::now().timestamp_millis(),
    file_hash: assembly.file_hash,
    last_retry: String::new(),
  };

  trace!(path = %path, chunks = chunks.len(), "File complete, queueing write");
  writer.replace_chunks(path.to_string(), chunks, vectors, status).await;
}
