//! The concurrent indexing engine: priority file queue, file workers,
//! embedding batcher, memory throttle.
//!
//! ```text
//! File queue ──► [W workers] ──chunks──► Embed queue ──batches──► Embedder
//!                                                                    │
//!                     Store ◄── Write queue ◄── per-file assemblies ◄┘
//! ```
//!
//! Back-pressure: workers stop pulling files while the embed queue is above
//! its threshold; the batcher stops dispatching while the write queue is
//! above its threshold. No work is ever dropped silently.

mod batcher;
mod memory;
mod queue;
mod worker;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use db::{DepthGauge, StatusCache, WriteHandle};
use embedding::Embedder;
use index::{Chunker, ParserRegistry};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use batcher::BatcherConfig;
pub use memory::{rss_bytes, spawn_memory_monitor, MemoryMonitorConfig, WorkerGate};
pub use queue::{FileQueue, Priority};
pub use worker::{EmbedItem, FileStat, WorkerContext};

use batcher::embed_batcher;
use worker::file_worker;

/// Paths unlinked while their work may still be in flight. Workers and the
/// batcher consult this before writing; a fresh pass for the path clears it.
#[derive(Debug, Default)]
pub struct Tombstones {
  inner: Mutex<HashSet<String>>,
}

impl Tombstones {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn insert(&self, path: &str) {
    self.inner.lock().expect("tombstone lock").insert(path.to_string());
  }

  pub fn contains(&self, path: &str) -> bool {
    self.inner.lock().expect("tombstone lock").contains(path)
  }

  pub fn clear(&self, path: &str) {
    self.inner.lock().expect("tombstone lock").remove(path);
  }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
  /// Worker concurrency: `max(4, cores - 1)` leaves one core for the UI.
  pub workers: usize,
  /// Concurrency under memory pressure: `max(2, cores / 4)`.
  pub throttled_workers: usize,
  pub embed_queue_capacity: usize,
  pub embed_backpressure: usize,
  pub batcher: BatcherConfig,
  /// RSS above this throttles worker concurrency.
  pub memory_throttle_bytes: u64,
  /// Soft RSS target; a sustained breach pauses the pipeline.
  pub memory_pause_bytes: u64,
  pub memory_check_interval: Duration,
  pub stat_cache_capacity: u64,
  pub stat_cache_ttl: Duration,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    let cores = num_cpus::get();
    Self {
      workers: cores.saturating_sub(1).max(4),
      throttled_workers: (cores / 4).max(2),
      embed_queue_capacity: 2000,
      embed_backpressure: 1000,
      batcher: BatcherConfig::default(),
      memory_throttle_bytes: 800 * 1024 * 1024,
      memory_pause_bytes: 1500 * 1024 * 1024,
      memory_check_interval: Duration::from_secs(5),
      stat_cache_capacity: 8192,
      stat_cache_ttl: Duration::from_secs(5),
    }
  }
}

/// Shared collaborators the pipeline is built from.
pub struct PipelineDeps {
  pub registry: Arc<ParserRegistry>,
  pub chunker: Arc<Chunker>,
  pub cache: Arc<StatusCache>,
  pub writer: WriteHandle,
  pub embedder: Arc<dyn Embedder>,
}

pub struct Pipeline {
  pub queue: Arc<FileQueue>,
  pub tombstones: Arc<Tombstones>,
  embed_gauge: Arc<DepthGauge>,
  gate: Arc<WorkerGate>,
  stat_cache: moka::future::Cache<std::path::PathBuf, FileStat>,
  workers: Vec<JoinHandle<()>>,
  batcher: JoinHandle<()>,
  memory_monitor: JoinHandle<()>,
}

impl Pipeline {
  /// Spawn workers, batcher and memory monitor. Work starts flowing as soon
  /// as paths are pushed to the queue.
  pub fn start(config: PipelineConfig, deps: PipelineDeps, cancel: CancellationToken) -> Pipeline {
    let queue = FileQueue::new();
    let tombstones = Tombstones::new();
    let embed_gauge = DepthGauge::new(config.embed_backpressure);
    let gate = WorkerGate::new(config.workers);

    let (embed_tx, embed_rx) = mpsc::channel::<EmbedItem>(config.embed_queue_capacity);

    let stat_cache: moka::future::Cache<std::path::PathBuf, FileStat> = moka::future::Cache::builder()
      .max_capacity(config.stat_cache_capacity)
      .time_to_live(config.stat_cache_ttl)
      .build();

    let ctx = WorkerContext {
      queue: queue.clone(),
      registry: deps.registry,
      chunker: deps.chunker,
      cache: deps.cache,
      writer: deps.writer.clone(),
      embed_tx,
      embed_gauge: embed_gauge.clone(),
      stat_cache: stat_cache.clone(),
      tombstones: tombstones.clone(),
      gate: gate.clone(),
      cancel: cancel.clone(),
    };

    debug!(workers = config.workers, "Starting pipeline");
    let mut workers = Vec::with_capacity(config.workers);
    for worker_id in 0..config.workers {
      let ctx = ctx.clone();
      workers.push(tokio::spawn(async move {
        file_worker(worker_id, ctx).await;
      }));
    }
    // The batcher's receiver closes once every worker has dropped its
    // sender clone.
    drop(ctx);

    let batcher = tokio::spawn(embed_batcher(
      embed_rx,
      embed_gauge.clone(),
      deps.embedder,
      deps.writer,
      tombstones.clone(),
      config.batcher.clone(),
      cancel.clone(),
    ));

    let memory_monitor = spawn_memory_monitor(
      gate.clone(),
      MemoryMonitorConfig {
        throttle_bytes: config.memory_throttle_bytes,
        pause_bytes: config.memory_pause_bytes,
        sustained_samples: 3,
        full_workers: config.workers,
        throttled_workers: config.throttled_workers,
        interval: config.memory_check_interval,
      },
      cancel.clone(),
    );

    Pipeline {
      queue,
      tombstones,
      embed_gauge,
      gate,
      stat_cache,
      workers,
      batcher,
      memory_monitor,
    }
  }

  /// Drop any cached stat for a path that just changed on disk, so the next
  /// pass re-reads fresh metadata instead of short-circuiting on stale data.
  pub async fn invalidate_stat(&self, path: &std::path::Path) {
    self.stat_cache.invalidate(path).await;
  }

  /// Shared handle to the stat cache, for event sources that must
  /// invalidate entries without owning the pipeline.
  pub fn stat_cache(&self) -> moka::future::Cache<std::path::PathBuf, FileStat> {
    self.stat_cache.clone()
  }

  pub fn embed_gauge(&self) -> Arc<DepthGauge> {
    self.embed_gauge.clone()
  }

  pub fn gate(&self) -> Arc<WorkerGate> {
    self.gate.clone()
  }

  /// Close the file queue and wait until every discovered file reached a
  /// terminal state. No timeout: losing work here loses user data.
  pub async fn drain_files(&self) {
    self.queue.close();
    self.queue.drain().await;
  }

  /// Wait for the embedding queue (including in-process batches) to empty.
  pub async fn drain_embed(&self) {
    self.embed_gauge.wait_empty().await;
  }

  /// Stop the memory monitor (shutdown step: clear periodic monitors).
  pub fn stop_monitors(&self) {
    self.memory_monitor.abort();
  }

  /// Await worker and batcher termination. Call after `drain_files`.
  pub async fn join(self) {
    for worker in self.workers {
      let _ = worker.await;
    }
    let _ = self.batcher.await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn tombstones_round_trip() {
    let tombs = Tombstones::new();
    assert!(!tombs.contains("/a"));
    tombs.insert("/a");
    assert!(tombs.contains("/a"));
    tombs.clear("/a");
    assert!(!tombs.contains("/a"));
  }

  #[test]
  fn default_config_respects_spec_floors() {
    let config = PipelineConfig::default();
    assert!(config.workers >= 4, "minimum of four workers");
    assert!(config.throttled_workers >= 2);
    assert!(config.throttled_workers <= config.workers);
    assert_eq!(config.embed_queue_capacity, 2000);
    assert_eq!(config.embed_backpressure, 1000);
    assert_eq!(config.batcher.batch_size, 32);
    assert_eq!(config.batcher.max_attempts, 3);
  }
}
