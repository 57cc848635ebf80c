//! Embedder sidecar lifecycle.
//!
//! The service exclusively owns the subprocess handle and its stdio streams.
//! Progress events arrive as `PROGRESS:<json>` lines on stdout; everything
//! else on stdout/stderr is forwarded to the log.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use semadex_core::{CoreError, ErrorCode, SidecarConfig};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, Mutex};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
  progress::{parse_progress_line, SidecarEvent},
  EmbeddingError,
};

#[derive(Debug, Clone)]
pub struct SidecarSettings {
  pub command: String,
  pub args: Vec<String>,
  pub port: u16,
  pub runtime_dir: Option<PathBuf>,
  pub preflight_imports: Vec<String>,
  pub startup_timeout: Duration,
  pub shutdown_timeout: Duration,
  pub restart_delay: Duration,
  pub max_restarts: u32,
  pub restart_window: Duration,
}

impl SidecarSettings {
  pub fn from_config(config: &SidecarConfig) -> Self {
    Self {
      command: config.command.clone(),
      args: config.args.clone(),
      port: config.port,
      runtime_dir: config.runtime_dir.clone(),
      preflight_imports: config.preflight_imports.clone(),
      startup_timeout: Duration::from_secs(config.startup_timeout_secs),
      shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
      restart_delay: Duration::from_secs(2),
      max_restarts: 3,
      restart_window: Duration::from_secs(300),
    }
  }

  fn health_url(&self) -> String {
    format!("http://127.0.0.1:{}/health", self.port)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SidecarState {
  Stopped,
  Starting,
  Running,
  Crashed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SidecarStatus {
  pub state: SidecarState,
  pub pid: Option<u32>,
  pub uptime_secs: u64,
  pub restarts: u32,
}

/// Bounds auto-restarts to `max` within a rolling window.
#[derive(Debug)]
struct RestartBudget {
  window: Duration,
  max: u32,
  attempts: VecDeque<Instant>,
}

impl RestartBudget {
  fn new(max: u32, window: Duration) -> Self {
    Self {
      window,
      max,
      attempts: VecDeque::new(),
    }
  }

  fn try_restart(&mut self, now: Instant) -> bool {
    while let Some(front) = self.attempts.front() {
      if now.duration_since(*front) > self.window {
        self.attempts.pop_front();
      } else {
        break;
      }
    }
    if self.attempts.len() as u32 >= self.max {
      return false;
    }
    self.attempts.push_back(now);
    true
  }
}

struct Inner {
  child: Option<Child>,
  state: SidecarState,
  started_at: Option<Instant>,
}

pub struct SidecarService {
  settings: SidecarSettings,
  inner: Mutex<Inner>,
  budget: Mutex<RestartBudget>,
  restarts: AtomicU32,
  auto_restart: AtomicBool,
  model_cached: AtomicBool,
  progress_tx: broadcast::Sender<SidecarEvent>,
  probe: reqwest::Client,
  cancel: CancellationToken,
}

impl SidecarService {
  pub fn new(settings: SidecarSettings) -> Arc<Self> {
    let (progress_tx, _) = broadcast::channel(64);
    Arc::new(Self {
      budget: Mutex::new(RestartBudget::new(settings.max_restarts, settings.restart_window)),
      settings,
      inner: Mutex::new(Inner {
        child: None,
        state: SidecarState::Stopped,
        started_at: None,
      }),
      restarts: AtomicU32::new(0),
      auto_restart: AtomicBool::new(true),
      model_cached: AtomicBool::new(false),
      progress_tx,
      probe: reqwest::Client::new(),
      cancel: CancellationToken::new(),
    })
  }

  /// Progress events parsed from the subprocess stdout.
  pub fn subscribe(&self) -> broadcast::Receiver<SidecarEvent> {
    self.progress_tx.subscribe()
  }

  /// True once the subprocess has signalled `model_cached` on stdout.
  pub fn model_cached(&self) -> bool {
    self.model_cached.load(Ordering::Acquire)
  }

  /// Stage-2 pre-flight: the runtime must exist and the required modules
  /// must be importable. Failures carry remediation text.
  pub async fn preflight(&self) -> Result<(), CoreError> {
    let version_check = Command::new(&self.settings.command)
      .arg("--version")
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .status()
      .await;

    match version_check {
      Ok(status) if status.success() => {}
      _ => {
        return Err(CoreError::typed_with_details(
          ErrorCode::RuntimeMissing,
          format!("{} is not available on PATH", self.settings.command),
          remediation("install the runtime and re-run", "reinstall the application"),
        ));
      }
    }

    for module in &self.settings.preflight_imports {
      let status = Command::new(&self.settings.command)
        .arg("-c")
        .arg(format!("import {module}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
      if !matches!(status, Ok(s) if s.success()) {
        return Err(CoreError::typed_with_details(
          ErrorCode::DependenciesMissing,
          format!("required module '{module}' is not importable"),
          remediation(
            &format!("run `{} -m pip install {module}`", self.settings.command),
            "reinstall the application",
          ),
        ));
      }
    }

    Ok(())
  }

  /// Spawn the subprocess and start the stdio pumps and exit monitor.
  /// Does not wait for health; see [`SidecarService::wait_healthy`].
  pub async fn spawn(self: &Arc<Self>) -> Result<(), CoreError> {
    let mut inner = self.inner.lock().await;
    if inner.child.is_some() {
      debug!("Sidecar already running, spawn is a no-op");
      return Ok(());
    }

    let mut cmd = Command::new(&self.settings.command);
    cmd.args(&self.settings.args);
    cmd.arg("--port").arg(self.settings.port.to_string());
    if let Some(runtime_dir) = &self.settings.runtime_dir {
      let path = std::env::var("PATH").unwrap_or_default();
      cmd.env("PATH", format!("{}:{path}", runtime_dir.display()));
    }
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| {
      CoreError::typed_with_details(
        ErrorCode::SidecarStartFailed,
        format!("failed to spawn {}: {e}", self.settings.command),
        remediation("check the sidecar command in config.json", "reinstall the application"),
      )
    })?;

    info!(pid = ?child.id(), port = self.settings.port, "Sidecar spawned");

    if let Some(stdout) = child.stdout.take() {
      let service = self.clone();
      tokio::spawn(async move { service.pump_stdout(stdout).await });
    }
    if let Some(stderr) = child.stderr.take() {
      tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
          debug!(target: "sidecar", "{line}");
        }
      });
    }

    inner.child = Some(child);
    inner.state = SidecarState::Starting;
    inner.started_at = Some(Instant::now());
    drop(inner);

    self.spawn_monitor();
    Ok(())
  }

  /// Poll `/health` until it answers or the timeout expires.
  pub async fn wait_healthy(&self, deadline: Duration) -> Result<(), CoreError> {
    let url = self.settings.health_url();
    let start = Instant::now();
    loop {
      if start.elapsed() > deadline {
        return Err(CoreError::typed(
          ErrorCode::SidecarNotHealthy,
          format!("sidecar did not become healthy within {deadline:?}"),
        ));
      }
      match self.probe.get(&url).timeout(Duration::from_secs(2)).send().await {
        Ok(response) if response.status().is_success() => {
          let mut inner = self.inner.lock().await;
          inner.state = SidecarState::Running;
          info!("Sidecar healthy");
          return Ok(());
        }
        _ => sleep(Duration::from_millis(500)).await,
      }
    }
  }

  /// Spawn and wait until the health probe passes.
  pub async fn start(self: &Arc<Self>) -> Result<(), CoreError> {
    self.spawn().await?;
    self.wait_healthy(self.settings.startup_timeout).await
  }

  /// Polite termination, bounded wait, then forced kill.
  pub async fn stop(&self) {
    self.auto_restart.store(false, Ordering::Release);
    let child = {
      let mut inner = self.inner.lock().await;
      inner.state = SidecarState::Stopped;
      inner.started_at = None;
      inner.child.take()
    };

    let Some(mut child) = child else {
      return;
    };

    terminate_politely(&child);

    match timeout(self.settings.shutdown_timeout, child.wait()).await {
      Ok(Ok(status)) => debug!(?status, "Sidecar exited"),
      _ => {
        warn!("Sidecar did not exit in time, killing");
        let _ = child.kill().await;
      }
    }
  }

  /// Stop then start. Counts toward the restart total.
  pub async fn restart(self: &Arc<Self>) -> Result<(), CoreError> {
    self.stop().await;
    self.restarts.fetch_add(1, Ordering::AcqRel);
    self.auto_restart.store(true, Ordering::Release);
    self.start().await
  }

  pub async fn status(&self) -> SidecarStatus {
    let inner = self.inner.lock().await;
    SidecarStatus {
      state: inner.state,
      pid: inner.child.as_ref().and_then(|c| c.id()),
      uptime_secs: inner.started_at.map(|t| t.elapsed().as_secs()).unwrap_or(0),
      restarts: self.restarts.load(Ordering::Acquire),
    }
  }

  async fn pump_stdout(&self, stdout: tokio::process::ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
      match parse_progress_line(&line) {
        Some(event) => {
          if matches!(event, SidecarEvent::ModelCached { .. }) {
            self.model_cached.store(true, Ordering::Release);
          }
          debug!(?event, "Sidecar progress");
          let _ = self.progress_tx.send(event);
        }
        None => debug!(target: "sidecar", "{line}"),
      }
    }
  }

  /// Watch for unexpected exits and restart within the budget.
  fn spawn_monitor(self: &Arc<Self>) {
    let service = self.clone();
    tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = service.cancel.cancelled() => return,
          _ = sleep(Duration::from_millis(500)) => {}
        }

        let exited = {
          let mut inner = service.inner.lock().await;
          match inner.child.as_mut() {
            None => return, // stopped deliberately, monitor retires
            Some(child) => match child.try_wait() {
              Ok(Some(status)) => {
                inner.child = None;
                inner.state = SidecarState::Crashed;
                inner.started_at = None;
                Some(status)
              }
              Ok(None) => None,
              Err(e) => {
                warn!(error = %e, "Failed to poll sidecar");
                None
              }
            },
          }
        };

        let Some(status) = exited else { continue };

        if !service.auto_restart.load(Ordering::Acquire) {
          return;
        }

        warn!(?status, "Sidecar exited unexpectedly");
        let allowed = service.budget.lock().await.try_restart(Instant::now());
        if !allowed {
          service.auto_restart.store(false, Ordering::Release);
          error!(
            max = service.settings.max_restarts,
            "Sidecar restart budget exhausted, auto-restart disabled"
          );
          return;
        }

        sleep(service.settings.restart_delay).await;
        service.restarts.fetch_add(1, Ordering::AcqRel);
        info!("Auto-restarting sidecar");
        if let Err(e) = service.spawn().await {
          error!(error = %e, "Sidecar auto-restart failed");
          return;
        }
        // A fresh monitor was spawned for the new child.
        return;
      }
    });
  }
}

impl Drop for SidecarService {
  fn drop(&mut self) {
    self.cancel.cancel();
  }
}

#[cfg(unix)]
fn terminate_politely(child: &Child) {
  if let Some(pid) = child.id() {
    // SIGTERM first; escalation to SIGKILL happens after the bounded wait.
    unsafe {
      libc::kill(pid as i32, libc::SIGTERM);
    }
  }
}

#[cfg(not(unix))]
fn terminate_politely(_child: &Child) {}

fn remediation(dev: &str, packaged: &str) -> String {
  if cfg!(debug_assertions) {
    dev.to_string()
  } else {
    packaged.to_string()
  }
}

/// Convert a typed embedding failure into the startup error taxonomy.
impl From<EmbeddingError> for CoreError {
  fn from(e: EmbeddingError) -> Self {
    CoreError::typed(e.code(), e.to_string())
  }
}
