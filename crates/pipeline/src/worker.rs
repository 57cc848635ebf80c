//! File workers: stat → hash short-circuit → decode → chunk → enqueue.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use db::{DepthGauge, StatusCache, WriteHandle};
use index::{Chunker, ParserRegistry, TextChunk};
use moka::future::Cache;
use semadex_core::{FileHash, FileStatus, FileStatusRecord};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{memory::WorkerGate, queue::FileQueue, Tombstones};

/// One chunk headed for the embedder. Every item carries its *own* source
/// path; the batcher keys produced rows to it, never to any notion of a
/// "current file".
#[derive(Debug, Clone)]
pub struct EmbedItem {
  pub path: String,
  pub chunk: TextChunk,
  pub total_chunks: u32,
  pub title: String,
  pub doc_type: String,
  pub mtime_ms: i64,
  pub parser_version: u32,
  pub file_hash: String,
}

/// Cached file metadata shared by the workers.
#[derive(Debug, Clone)]
pub struct FileStat {
  pub size: u64,
  pub mtime_ms: i64,
  pub mtime_ns: u128,
}

impl FileStat {
  pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
    let (mtime_ms, mtime_ns) = meta
      .modified()
      .ok()
      .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
      .map(|d| (d.as_millis() as i64, d.as_nanos()))
      .unwrap_or((0, 0));
    Self {
      size: meta.len(),
      mtime_ms,
      mtime_ns,
    }
  }
}

/// Everything a worker needs, threaded explicitly.
#[derive(Clone)]
pub struct WorkerContext {
  pub queue: Arc<FileQueue>,
  pub registry: Arc<ParserRegistry>,
  pub chunker: Arc<Chunker>,
  pub cache: Arc<StatusCache>,
  pub writer: WriteHandle,
  pub embed_tx: mpsc::Sender<EmbedItem>,
  pub embed_gauge: Arc<DepthGauge>,
  pub stat_cache: Cache<PathBuf, FileStat>,
  pub tombstones: Arc<Tombstones>,
  pub gate: Arc<WorkerGate>,
  pub cancel: CancellationToken,
}

pub async fn file_worker(worker_id: usize, ctx: WorkerContext) {
  trace!(worker_id, "File worker starting");
  let mut processed = 0usize;

  loop {
    // Back-pressure from the embedding queue: stop pulling new files until
    // depth recedes below the threshold.
    tokio::select! {
      biased;
      _ = ctx.cancel.cancelled() => break,
      _ = ctx.embed_gauge.wait_below_threshold() => {}
    }

    // Memory throttle.
    let _slot = tokio::select! {
      biased;
      _ = ctx.cancel.cancelled() => break,
      slot = ctx.gate.acquire() => slot,
    };

    let path = tokio::select! {
      biased;
      _ = ctx.cancel.cancelled() => break,
      path = ctx.queue.pop() => match path {
        Some(p) => p,
        None => break,
      },
    };

    process_file(worker_id, &ctx, &path).await;
    ctx.queue.task_done(&path);
    processed += 1;
  }

  trace!(worker_id, processed, "File worker finished");
}

async fn process_file(worker_id: usize, ctx: &WorkerContext, path: &Path) {
  let path_str = path.to_string_lossy().to_string();

  // A fresh pass supersedes any older unlink tombstone for this path.
  ctx.tombstones.clear(&path_str);

  let Some(stat) = stat_file(ctx, path).await else {
    // Vanished between discovery and processing: treat as unlink.
    debug!(worker_id, path = %path_str, "File gone, removing from store");
    ctx.writer.remove_path(path_str).await;
    return;
  };

  let Some(extension) = path.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase()) else {
    trace!(worker_id, path = %path_str, "No extension, skipping");
    return;
  };
  let Some((decoder, parser_version)) = ctx.registry.get(&extension) else {
    trace!(worker_id, path = %path_str, ext = %extension, "No decoder registered");
    return;
  };

  let file_hash = FileHash::new(stat.size, stat.mtime_ns);

  if let Some(cached) = ctx.cache.get(&path_str).await {
    let unchanged = cached.file_hash == file_hash.as_str() && cached.parser_version == parser_version;
    match cached.status {
      // Short-circuit: same content identity and same decoder version.
      FileStatus::Indexed if unchanged => {
        trace!(worker_id, path = %path_str, "Unchanged, skipping");
        return;
      }
      // A failed file retries only on content change, parser bump, or once
      // the retry window has elapsed.
      FileStatus::Failed | FileStatus::Error if unchanged && !retry_window_elapsed(&cached.last_retry) => {
        trace!(worker_id, path = %path_str, "Failed recently, not retrying yet");
        return;
      }
      _ => {}
    }
  }

  let decode_path = path.to_path_buf();
  let decoded = match tokio::task::spawn_blocking(move || decoder.decode(&decode_path)).await {
    Ok(Ok(decoded)) => decoded,
    Ok(Err(e)) => {
      debug!(worker_id, path = %path_str, error = %e, "Decode failed");
      mark_failed(ctx, &path_str, parser_version, &stat, &file_hash, e.to_string()).await;
      return;
    }
    Err(e) => {
      warn!(worker_id, path = %path_str, error = %e, "Decoder panicked");
      mark_failed(ctx, &path_str, parser_version, &stat, &file_hash, "decoder crashed".to_string()).await;
      return;
    }
  };

  if decoded.char_count() == 0 {
    mark_failed(ctx, &path_str, parser_version, &stat, &file_hash, "no text content".to_string()).await;
    return;
  }

  let chunks = ctx.chunker.chunk_decoded(&decoded);
  if chunks.is_empty() {
    mark_failed(ctx, &path_str, parser_version, &stat, &file_hash, "no text content".to_string()).await;
    return;
  }

  let total_chunks = chunks.len() as u32;
  let title = path
    .file_name()
    .map(|n| n.to_string_lossy().to_string())
    .unwrap_or_else(|| path_str.clone());

  trace!(worker_id, path = %path_str, chunks = total_chunks, "Parsed file");

  for chunk in chunks {
    // Unlinked mid-parse: abandon without writing.
    if ctx.cancel.is_cancelled() || ctx.tombstones.contains(&path_str) {
      debug!(worker_id, path = %path_str, "Abandoning cancelled file");
      return;
    }
    ctx.embed_gauge.inc();
    let item = EmbedItem {
      path: path_str.clone(),
      chunk,
      total_chunks,
      title: title.clone(),
      doc_type: extension.clone(),
      mtime_ms: stat.mtime_ms,
      parser_version,
      file_hash: file_hash.as_str().to_string(),
    };
    if ctx.embed_tx.send(item).await.is_err() {
      ctx.embed_gauge.dec();
      debug!(worker_id, "Embedding queue closed");
      return;
    }
  }
}

/// True when the 24 h retry window has passed (or was never stamped).
fn retry_window_elapsed(last_retry: &str) -> bool {
  if last_retry.is_empty() {
    return true;
  }
  match chrono::DateTime::parse_from_rfc3339(last_retry) {
    Ok(at) => Utc::now().signed_duration_since(at.with_timezone(&Utc)) >= chrono::Duration::hours(24),
    Err(_) => true,
  }
}

async fn stat_file(ctx: &WorkerContext, path: &Path) -> Option<FileStat> {
  if let Some(stat) = ctx.stat_cache.get(path).await {
    return Some(stat);
  }
  let meta = tokio::fs::metadata(path).await.ok()?;
  let stat = FileStat::from_metadata(&meta);
  ctx.stat_cache.insert(path.to_path_buf(), stat.clone()).await;
  Some(stat)
}

async fn mark_failed(
  ctx: &WorkerContext,
  path: &str,
  parser_version: u32,
  stat: &FileStat,
  file_hash: &FileHash,
  message: String,
) {
  // Each failed attempt records its wall-clock so the 24 h retry gate has
  // something to measure from.
  let record = FileStatusRecord {
    path: path.to_string(),
    status: FileStatus::Failed,
    parser_version,
    chunk_count: 0,
    error_message: message,
    last_modified: stat.mtime_ms,
    indexed_at: 0,
    file_hash: file_hash.as_str().to_string(),
    last_retry: Utc::now().to_rfc3339(),
  };
  ctx.writer.mark_status(record).await;
}
