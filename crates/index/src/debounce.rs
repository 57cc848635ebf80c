//! Write-stability debounce over the raw watcher.
//!
//! Files being streamed to disk fire a burst of events; an event is only
//! released once its path has been quiet for the stability window (~2 s), so
//! nothing is parsed mid-write. Events for the same path coalesce.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::watcher::{FileEvent, FileEventKind, FileWatcher};

#[derive(Debug, Clone)]
pub struct DebounceConfig {
  /// Quiet period before an event is released.
  pub stability_ms: u64,
  /// Pending-event count that forces an early flush.
  pub max_pending: usize,
}

impl Default for DebounceConfig {
  fn default() -> Self {
    Self {
      stability_ms: 2000,
      max_pending: 512,
    }
  }
}

#[derive(Debug, Clone)]
struct PendingEvent {
  kind: FileEventKind,
  last_seen: Instant,
}

impl PendingEvent {
  fn new(kind: FileEventKind) -> Self {
    Self {
      kind,
      last_seen: Instant::now(),
    }
  }

  fn update(&mut self, kind: FileEventKind) {
    self.last_seen = Instant::now();
    self.kind = coalesce(self.kind, kind);
  }
}

/// Coalescing table for consecutive events on one path.
fn coalesce(prior: FileEventKind, next: FileEventKind) -> FileEventKind {
  match (prior, next) {
    // A create followed by writes is still a create.
    (FileEventKind::Added, FileEventKind::Changed) => FileEventKind::Added,
    // Replace-by-rename shows up as remove+create.
    (FileEventKind::Removed, FileEventKind::Added) => FileEventKind::Changed,
    // A short-lived file cancels down to its removal.
    (FileEventKind::Added, FileEventKind::Removed) => FileEventKind::Removed,
    _ => next,
  }
}

/// Debouncing wrapper around [`FileWatcher`].
pub struct DebouncedWatcher {
  watcher: FileWatcher,
  config: DebounceConfig,
  pending: HashMap<PathBuf, PendingEvent>,
}

impl DebouncedWatcher {
  pub fn new(watcher: FileWatcher, config: DebounceConfig) -> Self {
    Self {
      watcher,
      config,
      pending: HashMap::new(),
    }
  }

  pub fn with_defaults(watcher: FileWatcher) -> Self {
    Self::new(watcher, DebounceConfig::default())
  }

  /// Drain raw watcher events into the pending map.
  pub fn poll_raw(&mut self) {
    while let Some(event) = self.watcher.poll() {
      self.absorb(event);
    }
  }

  fn absorb(&mut self, event: FileEvent) {
    if let Some(pending) = self.pending.get_mut(&event.path) {
      pending.update(event.kind);
    } else {
      self.pending.insert(event.path, PendingEvent::new(event.kind));
    }
  }

  /// Events whose paths have been stable for the configured window. When
  /// the pending map overflows, everything is released.
  pub fn collect_ready(&mut self) -> Vec<FileEvent> {
    self.poll_raw();

    if self.pending.len() >= self.config.max_pending {
      return self.collect_all();
    }

    let now = Instant::now();
    let stability = Duration::from_millis(self.config.stability_ms);

    let ready_paths: Vec<PathBuf> = self
      .pending
      .iter()
      .filter(|(_, pending)| now.duration_since(pending.last_seen) >= stability)
      .map(|(path, _)| path.clone())
      .collect();

    ready_paths
      .into_iter()
      .filter_map(|path| {
        self.pending.remove(&path).map(|pending| FileEvent {
          path,
          kind: pending.kind,
        })
      })
      .collect()
  }

  /// Release everything regardless of stability (used on shutdown).
  pub fn collect_all(&mut self) -> Vec<FileEvent> {
    self.poll_raw();
    self
      .pending
      .drain()
      .map(|(path, pending)| FileEvent {
        path,
        kind: pending.kind,
      })
      .collect()
  }

  pub fn pending_count(&self) -> usize {
    self.pending.len()
  }

  #[cfg(test)]
  fn inject(&mut self, path: &str, kind: FileEventKind) {
    self.absorb(FileEvent {
      path: PathBuf::from(path),
      kind,
    });
  }
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;

  fn watcher(dir: &TempDir, stability_ms: u64) -> DebouncedWatcher {
    let raw = FileWatcher::new(&[dir.path().to_path_buf()]).unwrap();
    DebouncedWatcher::new(
      raw,
      DebounceConfig {
        stability_ms,
        ..Default::default()
      },
    )
  }

  #[test]
  fn coalescing_table() {
    assert_eq!(coalesce(FileEventKind::Added, FileEventKind::Changed), FileEventKind::Added);
    assert_eq!(
      coalesce(FileEventKind::Removed, FileEventKind::Added),
      FileEventKind::Changed
    );
    assert_eq!(
      coalesce(FileEventKind::Added, FileEventKind::Removed),
      FileEventKind::Removed
    );
    assert_eq!(
      coalesce(FileEventKind::Changed, FileEventKind::Removed),
      FileEventKind::Removed
    );
  }

  #[test]
  fn events_wait_for_stability() {
    let dir = TempDir::new().unwrap();
    let mut debounced = watcher(&dir, 10_000);
    debounced.inject("/docs/a.txt", FileEventKind::Changed);

    assert!(
      debounced.collect_ready().is_empty(),
      "event must be held during the stability window"
    );
    assert_eq!(debounced.pending_count(), 1);
  }

  #[test]
  fn stable_events_are_released_once() {
    let dir = TempDir::new().unwrap();
    let mut debounced = watcher(&dir, 10);
    debounced.inject("/docs/a.txt", FileEventKind::Changed);

    std::thread::sleep(Duration::from_millis(50));
    let ready = debounced.collect_ready();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].kind, FileEventKind::Changed);
    assert!(debounced.collect_ready().is_empty(), "released events do not repeat");
  }

  #[test]
  fn burst_on_one_path_coalesces() {
    let dir = TempDir::new().unwrap();
    let mut debounced = watcher(&dir, 10);
    debounced.inject("/docs/a.txt", FileEventKind::Added);
    debounced.inject("/docs/a.txt", FileEventKind::Changed);
    debounced.inject("/docs/a.txt", FileEventKind::Changed);

    std::thread::sleep(Duration::from_millis(50));
    let ready = debounced.collect_ready();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].kind, FileEventKind::Added);
  }

  #[test]
  fn collect_all_ignores_stability() {
    let dir = TempDir::new().unwrap();
    let mut debounced = watcher(&dir, 60_000);
    debounced.inject("/docs/a.txt", FileEventKind::Changed);
    debounced.inject("/docs/b.txt", FileEventKind::Removed);

    let all = debounced.collect_all();
    assert_eq!(all.len(), 2);
    assert_eq!(debounced.pending_count(), 0);
  }
}
