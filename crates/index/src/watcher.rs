//! Raw filesystem watcher over the configured roots.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use tracing::{debug, warn};

use crate::IndexError;

/// Kind of change, in the vocabulary the pipeline consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
  Added,
  Changed,
  Removed,
}

#[derive(Debug, Clone)]
pub struct FileEvent {
  pub path: PathBuf,
  pub kind: FileEventKind,
}

/// Watches every configured root recursively.
pub struct FileWatcher {
  _watcher: RecommendedWatcher,
  receiver: Receiver<Result<Event, notify::Error>>,
  roots: Vec<PathBuf>,
}

impl FileWatcher {
  pub fn new(roots: &[PathBuf]) -> Result<Self, IndexError> {
    let (tx, rx) = channel();

    let mut watcher = RecommendedWatcher::new(
      move |res| {
        let _ = tx.send(res);
      },
      Config::default().with_poll_interval(Duration::from_secs(2)),
    )?;

    for root in roots {
      watcher.watch(root, RecursiveMode::Recursive)?;
    }

    Ok(Self {
      _watcher: watcher,
      receiver: rx,
      roots: roots.to_vec(),
    })
  }

  pub fn roots(&self) -> &[PathBuf] {
    &self.roots
  }

  /// Poll for the next event (non-blocking).
  pub fn poll(&self) -> Option<FileEvent> {
    match self.receiver.try_recv() {
      Ok(Ok(event)) => self.process_event(event),
      Ok(Err(e)) => {
        warn!("Watch error: {}", e);
        None
      }
      Err(_) => None,
    }
  }

  /// Collect all pending events.
  pub fn collect_pending(&self) -> Vec<FileEvent> {
    let mut events = Vec::new();
    while let Some(event) = self.poll() {
      events.push(event);
    }
    events
  }

  fn process_event(&self, event: Event) -> Option<FileEvent> {
    let path = event.paths.first()?.clone();

    // Directory churn is uninteresting; unlinked paths no longer exist so
    // is_dir() is false for them.
    if path.is_dir() {
      return None;
    }

    let kind = match event.kind {
      EventKind::Create(_) => FileEventKind::Added,
      EventKind::Modify(_) => FileEventKind::Changed,
      EventKind::Remove(_) => FileEventKind::Removed,
      EventKind::Access(_) | EventKind::Any | EventKind::Other => {
        debug!("Ignoring {:?} event for {:?}", event.kind, path);
        return None;
      }
    };

    Some(FileEvent { path, kind })
  }
}

/// True when `path` lives under any of the roots.
pub fn under_roots(roots: &[PathBuf], path: &Path) -> bool {
  roots.iter().any(|root| path.starts_with(root))
}

#[cfg(test)]
mod tests {
  use std::fs;

  use tempfile::TempDir;

  use super::*;

  #[test]
  fn watcher_creation() {
    let dir = TempDir::new().unwrap();
    let watcher = FileWatcher::new(&[dir.path().to_path_buf()]);
    assert!(watcher.is_ok());
  }

  #[test]
  fn watcher_detects_create() {
    let dir = TempDir::new().unwrap();
    let watcher = FileWatcher::new(&[dir.path().to_path_buf()]).unwrap();

    let file_path = dir.path().join("test.txt");
    fs::write(&file_path, "hello").unwrap();

    std::thread::sleep(Duration::from_millis(200));
    let events = watcher.collect_pending();

    // OS-level event batching makes the exact kind platform-dependent.
    let saw_file = events
      .iter()
      .any(|e| e.path == file_path && matches!(e.kind, FileEventKind::Added | FileEventKind::Changed));
    assert!(
      saw_file || events.is_empty(),
      "expected add/change for the new file or empty (timing), got {events:?}"
    );
  }

  #[test]
  fn under_roots_checks_prefixes() {
    let roots = vec![PathBuf::from("/docs"), PathBuf::from("/notes")];
    assert!(under_roots(&roots, Path::new("/docs/a/b.txt")));
    assert!(under_roots(&roots, Path::new("/notes/x.md")));
    assert!(!under_roots(&roots, Path::new("/tmp/other.txt")));
  }
}
