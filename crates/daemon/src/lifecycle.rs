//! Core construction and steady-state operation.
//!
//! `CoreBuilder::start` drives the nine startup stages in order; the
//! resulting `Core` owns every subsystem and tears them down through the
//! shutdown orchestrator.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use db::{spawn_store_writer, StatusCache, Store, WriteHandle, WriterConfig};
use embedding::{
  Embedder, HttpEmbedderClient, SidecarEvent, SidecarService, SidecarSettings,
};
use index::{
  plan_reindex, Chunker, DebouncedWatcher, FileEvent, FileEventKind, FileWatcher, ParserRegistry, Scanner,
};
use pipeline::{FileQueue, Pipeline, PipelineConfig, PipelineDeps, Priority, Tombstones};
use semadex_core::{
  Config, CoreError, ErrorCode, FileStatusRecord, StartupStage, UiEvent, DB_VERSION, DIM,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
  context::CoreContext,
  scheduler::{spawn_retry_scheduler, SchedulerConfig},
  search::{search, SearchHit},
  shutdown::{run_shutdown, ShutdownConfig, ShutdownParts},
  startup::StartupCoordinator,
  LifecycleError,
};

pub struct CoreBuilder {
  data_root: PathBuf,
  config: Option<Config>,
  embedder: Option<Arc<dyn Embedder>>,
  registry: ParserRegistry,
  events: Option<mpsc::Sender<UiEvent>>,
  watch: bool,
  pipeline_config: PipelineConfig,
  shutdown_config: ShutdownConfig,
  scheduler_config: SchedulerConfig,
}

impl CoreBuilder {
  pub fn new(data_root: impl Into<PathBuf>) -> Self {
    Self {
      data_root: data_root.into(),
      config: None,
      embedder: None,
      registry: ParserRegistry::builtin(),
      events: None,
      watch: true,
      pipeline_config: PipelineConfig::default(),
      shutdown_config: ShutdownConfig::default(),
      scheduler_config: SchedulerConfig::default(),
    }
  }

  /// Use this config instead of loading `config.json` from the data root.
  pub fn with_config(mut self, config: Config) -> Self {
    self.config = Some(config);
    self
  }

  /// Use an already-running embedding endpoint instead of launching the
  /// sidecar. The sidecar stages still run their checks against it.
  pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
    self.embedder = Some(embedder);
    self
  }

  /// Replace the parser registry (external decoders plug in here).
  pub fn with_registry(mut self, registry: ParserRegistry) -> Self {
    self.registry = registry;
    self
  }

  /// Receive startup progress and error envelopes.
  pub fn with_events(mut self, events: mpsc::Sender<UiEvent>) -> Self {
    self.events = Some(events);
    self
  }

  /// Disable the filesystem watcher (one-shot indexing runs).
  pub fn without_watcher(mut self) -> Self {
    self.watch = false;
    self
  }

  pub fn with_pipeline_config(mut self, config: PipelineConfig) -> Self {
    self.pipeline_config = config;
    self
  }

  pub async fn start(self) -> Result<Core, CoreError> {
    Core::start(self).await
  }
}

pub struct Core {
  ctx: CoreContext,
  pipeline: Pipeline,
  sidecar: Option<Arc<SidecarService>>,
  writer_task: JoinHandle<()>,
  watch_task: Option<JoinHandle<()>>,
  scheduler_task: JoinHandle<()>,
  scanner: Arc<Scanner>,
  ready_rx: watch::Receiver<bool>,
  shutdown_config: ShutdownConfig,
}

impl Core {
  async fn start(builder: CoreBuilder) -> Result<Core, CoreError> {
    let data_root = builder.data_root.clone();
    let config = match builder.config {
      Some(config) => config,
      None => Config::load(&data_root)?,
    };
    let config = Arc::new(config);
    let registry = Arc::new(builder.registry);

    let (coordinator, ready_rx) = StartupCoordinator::new(builder.events);

    // Stage 1: worker_spawn — pipeline bootstrap. Workers go live at
    // `ready`, once the store and embedder they depend on exist.
    let scanner = coordinator
      .stage(StartupStage::WorkerSpawn, async {
        Scanner::from_config(&config).map_err(|e| CoreError::Config(e.to_string())).map(Arc::new)
      })
      .await?;
    let chunker = Arc::new(Chunker::default());

    // Stages 2–5: embedder bring-up.
    let (embedder, sidecar) = match builder.embedder {
      Some(external) => {
        coordinator.stage(StartupStage::SidecarStart, async { Ok(()) }).await?;
        // An external endpoint has nothing to download.
        coordinator.skip(StartupStage::Downloading).await;
        coordinator
          .stage(StartupStage::SidecarReady, async {
            external
              .health()
              .await
              .map(|_| ())
              .map_err(|e| CoreError::typed(ErrorCode::SidecarNotHealthy, e.to_string()))
          })
          .await?;
        coordinator
          .stage(StartupStage::EmbedderInit, round_trip(external.clone()))
          .await?;
        (external, None)
      }
      None => {
        let sidecar = SidecarService::new(SidecarSettings::from_config(&config.sidecar));
        // Subscribe before spawn so no progress line is missed.
        let progress = sidecar.subscribe();

        coordinator
          .stage(StartupStage::SidecarStart, async {
            sidecar.preflight().await?;
            sidecar.spawn().await
          })
          .await?;

        if sidecar.model_cached() {
          coordinator.skip(StartupStage::Downloading).await;
        } else {
          coordinator
            .stage(StartupStage::Downloading, download_stage(&sidecar, progress))
            .await?;
        }

        coordinator
          .stage(
            StartupStage::SidecarReady,
            sidecar.wait_healthy(Duration::from_secs(config.sidecar.startup_timeout_secs)),
          )
          .await?;

        let client: Arc<dyn Embedder> = Arc::new(HttpEmbedderClient::with_timeout(
          config.sidecar.port,
          DIM,
          Duration::from_secs(config.sidecar.request_timeout_secs),
        ));
        coordinator
          .stage(StartupStage::EmbedderInit, round_trip(client.clone()))
          .await?;
        (client, Some(sidecar))
      }
    };

    // Stage 6: db_init — schema version gate runs inside open.
    let (store, rebuilt) = coordinator
      .stage(StartupStage::DbInit, async {
        Store::open(&data_root, DIM, DB_VERSION)
          .await
          .map_err(|e| CoreError::typed(ErrorCode::OpenFailed, e.to_string()))
      })
      .await?;
    if rebuilt {
      info!("Store was rebuilt; full re-index ahead");
    }
    let store = Arc::new(store);
    let status_cache = Arc::new(StatusCache::new());
    let (writer, writer_task) = spawn_store_writer(store.clone(), status_cache.clone(), WriterConfig::default());

    // Stage 7: db_load — status table into the in-memory cache.
    coordinator
      .stage(StartupStage::DbLoad, async {
        let records = store
          .load_all_statuses()
          .await
          .map_err(|e| CoreError::typed(ErrorCode::OpenFailed, e.to_string()))?;
        status_cache.replace_all(&records).await;
        Ok(records.len())
      })
      .await?;

    // Stage 8: folder_scan — planner surge first, then root enumeration.
    let initial_work = coordinator
      .stage(
        StartupStage::FolderScan,
        folder_scan(&config, &scanner, &store, &registry, &status_cache, &writer),
      )
      .await?;

    // Stage 9: ready — arm the pipeline and release the file queue.
    let cancel = CancellationToken::new();
    let pipeline = Pipeline::start(
      builder.pipeline_config,
      PipelineDeps {
        registry: registry.clone(),
        chunker,
        cache: status_cache.clone(),
        writer: writer.clone(),
        embedder: embedder.clone(),
      },
      cancel.clone(),
    );
    for (path, priority) in initial_work {
      pipeline.queue.push(path, priority);
    }

    let watch_task = if builder.watch {
      Some(spawn_watch_task(
        config.watched_folders.clone(),
        scanner.clone(),
        config.max_file_size_bytes(),
        pipeline.queue.clone(),
        pipeline.tombstones.clone(),
        pipeline.stat_cache(),
        writer.clone(),
        cancel.clone(),
      )?)
    } else {
      None
    };

    let scheduler_task = spawn_retry_scheduler(
      store.clone(),
      pipeline.queue.clone(),
      builder.scheduler_config,
      cancel.clone(),
    );

    coordinator.stage(StartupStage::Ready, async { Ok(()) }).await?;
    coordinator.mark_ready();
    info!("Core ready");

    Ok(Core {
      ctx: CoreContext {
        config,
        store,
        writer,
        status_cache,
        registry,
        embedder,
        cancel,
      },
      pipeline,
      sidecar,
      writer_task,
      watch_task,
      scheduler_task,
      scanner,
      ready_rx,
      shutdown_config: builder.shutdown_config,
    })
  }

  /// The renderer may query this at any time to bypass the progress
  /// overlay; startup is never re-run for a reloaded UI.
  pub fn is_ready(&self) -> bool {
    *self.ready_rx.borrow()
  }

  pub fn ready_watch(&self) -> watch::Receiver<bool> {
    self.ready_rx.clone()
  }

  pub fn context(&self) -> &CoreContext {
    &self.ctx
  }

  pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, LifecycleError> {
    search(&self.ctx, query, limit).await
  }

  pub async fn file_status(&self, path: &str) -> Result<Option<FileStatusRecord>, LifecycleError> {
    Ok(self.ctx.store.get_file_status(path).await?)
  }

  /// Feed one file event into the pipeline, exactly as the watcher would.
  pub async fn notify_event(&self, event: FileEvent) {
    handle_event(
      &self.scanner,
      self.ctx.config.max_file_size_bytes(),
      &self.pipeline.queue,
      &self.pipeline.tombstones,
      &self.pipeline.stat_cache(),
      &self.ctx.writer,
      event,
    )
    .await;
  }

  /// Wait until the queue, embedding stage and write queue are all empty.
  pub async fn wait_idle(&self) {
    self.pipeline.queue.drain().await;
    self.pipeline.embed_gauge().wait_empty().await;
    self.ctx.writer.flush().await;
  }

  /// Run the eight-step shutdown drain, consuming the core.
  pub async fn shutdown(self) {
    let Core {
      ctx,
      pipeline,
      sidecar,
      writer_task,
      watch_task,
      scheduler_task,
      shutdown_config,
      ..
    } = self;

    run_shutdown(
      ShutdownParts {
        pipeline,
        writer: ctx.writer.clone(),
        writer_task,
        sidecar,
        watch_task,
        scheduler_task,
        cancel: ctx.cancel.clone(),
      },
      &shutdown_config,
    )
    .await;
  }
}

/// Embedder warm-up round trip: one embed call plus a dimension check.
async fn round_trip(embedder: Arc<dyn Embedder>) -> Result<(), CoreError> {
  let vectors = embedder
    .embed(&["semadex warmup".to_string()], true)
    .await
    .map_err(|e| CoreError::typed(ErrorCode::EmbedderInitFailed, e.to_string()))?;
  let dim = vectors.first().map(|v| v.len()).unwrap_or(0);
  if dim != embedder.dimensions() {
    return Err(CoreError::typed(
      ErrorCode::EmbedderInitFailed,
      format!("warmup returned dimension {dim}, expected {}", embedder.dimensions()),
    ));
  }
  Ok(())
}

/// Wait for the model to be ready: either the progress stream says so, or
/// the health probe passes first (a sidecar with nothing to say).
async fn download_stage(
  sidecar: &Arc<SidecarService>,
  mut progress: broadcast::Receiver<SidecarEvent>,
) -> Result<(), CoreError> {
  let model_ready = async {
    loop {
      match progress.recv().await {
        Ok(SidecarEvent::ModelCached { .. }) | Ok(SidecarEvent::ModelLoaded { .. }) => return,
        Ok(SidecarEvent::DownloadStarted { model }) => info!(model = %model, "Model download started"),
        Err(broadcast::error::RecvError::Lagged(_)) => continue,
        Err(broadcast::error::RecvError::Closed) => return,
      }
    }
  };

  tokio::select! {
    _ = model_ready => Ok(()),
    result = sidecar.wait_healthy(StartupStage::Downloading.timeout()) => result,
  }
}

/// Stage 8 body: planner surge, root enumeration, deletion reconciliation.
async fn folder_scan(
  config: &Arc<Config>,
  scanner: &Arc<Scanner>,
  store: &Arc<Store>,
  registry: &Arc<ParserRegistry>,
  status_cache: &Arc<StatusCache>,
  writer: &WriteHandle,
) -> Result<Vec<(PathBuf, Priority)>, CoreError> {
  let mut work: Vec<(PathBuf, Priority)> = Vec::new();

  // Planner first so its entries land ahead of scan discoveries.
  let plan = plan_reindex(store, registry)
    .await
    .map_err(|e| CoreError::typed(ErrorCode::OpenFailed, e.to_string()))?;
  for record in plan.outdated {
    let path = PathBuf::from(&record.path);
    writer.mark_status(record).await;
    work.push((path, Priority::Outdated));
  }
  for path in plan.retries {
    work.push((PathBuf::from(path), Priority::New));
  }

  let mut seen: HashSet<String> = HashSet::new();
  for root in &config.watched_folders {
    if !root.exists() {
      warn!(root = %root.display(), "Watched folder missing, skipping");
      continue;
    }
    let result = scanner.scan(root);
    for file in result.files {
      let path_str = file.path.to_string_lossy().to_string();
      seen.insert(path_str.clone());
      let priority = match status_cache.get(&path_str).await {
        None => Priority::New,
        // The worker's hash short-circuit turns unchanged files into no-ops.
        Some(_) => Priority::Modified,
      };
      work.push((file.path, priority));
    }
  }

  // Files that vanished while the core was not running.
  for known in status_cache.paths().await {
    let path = PathBuf::from(&known);
    let under_watched_root = config.watched_folders.iter().any(|root| path.starts_with(root));
    if under_watched_root && !seen.contains(&known) && !path.exists() {
      writer.remove_path(known).await;
    }
  }

  Ok(work)
}

async fn handle_event(
  scanner: &Scanner,
  max_bytes: u64,
  queue: &FileQueue,
  tombstones: &Tombstones,
  stat_cache: &moka::future::Cache<PathBuf, pipeline::FileStat>,
  writer: &WriteHandle,
  event: FileEvent,
) {
  // The stat from before this event is no longer trustworthy.
  stat_cache.invalidate(&event.path).await;

  let path_str = event.path.to_string_lossy().to_string();
  match event.kind {
    FileEventKind::Removed => {
      tombstones.insert(&path_str);
      writer.remove_path(path_str).await;
    }
    FileEventKind::Added | FileEventKind::Changed => {
      if !scanner.admits(&event.path) {
        return;
      }
      if let Ok(meta) = tokio::fs::metadata(&event.path).await
        && meta.len() > max_bytes
      {
        return;
      }
      let priority = match event.kind {
        FileEventKind::Added => Priority::New,
        _ => Priority::Modified,
      };
      queue.push(event.path, priority);
    }
  }
}

#[allow(clippy::too_many_arguments)]
fn spawn_watch_task(
  roots: Vec<PathBuf>,
  scanner: Arc<Scanner>,
  max_bytes: u64,
  queue: Arc<FileQueue>,
  tombstones: Arc<Tombstones>,
  stat_cache: moka::future::Cache<PathBuf, pipeline::FileStat>,
  writer: WriteHandle,
  cancel: CancellationToken,
) -> Result<JoinHandle<()>, CoreError> {
  let raw = FileWatcher::new(&roots).map_err(|e| CoreError::Config(format!("watcher: {e}")))?;
  let mut debounced = DebouncedWatcher::with_defaults(raw);

  Ok(tokio::spawn(async move {
    let mut tick = tokio::time::interval(Duration::from_millis(500));
    loop {
      tokio::select! {
        biased;
        _ = cancel.cancelled() => break,
        _ = tick.tick() => {}
      }
      for event in debounced.collect_ready() {
        handle_event(&scanner, max_bytes, &queue, &tombstones, &stat_cache, &writer, event).await;
      }
    }
  }))
}
