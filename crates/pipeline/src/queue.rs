//! Priority file queue feeding the pipeline workers.
//!
//! Three bands (outdated ≫ new ≫ modified) with one live entry per path.
//! Re-enqueues coalesce, keeping the better priority; a re-enqueue for a
//! path currently being processed is deferred until that pass completes, so
//! one path is never worked on by two workers at once. In-flight work is
//! tracked so the shutdown drain can wait for every discovered file to
//! reach a terminal state.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::Notify;

/// Band order doubles as service order: lower value is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
  Outdated = 0,
  New = 1,
  Modified = 2,
}

impl Priority {
  const COUNT: usize = 3;

  fn band(self) -> usize {
    self as usize
  }
}

#[derive(Default)]
struct Inner {
  bands: [VecDeque<PathBuf>; Priority::COUNT],
  /// Truth for membership and priority; band entries not matching this map
  /// are stale and skipped on pop.
  queued: HashMap<PathBuf, Priority>,
  /// Paths currently held by a worker, with an optional deferred
  /// re-enqueue priority recorded while they were busy.
  in_flight: HashMap<PathBuf, Option<Priority>>,
  closed: bool,
}

impl Inner {
  fn enqueue(&mut self, path: PathBuf, priority: Priority, front: bool) {
    match self.queued.get(&path) {
      Some(existing) if *existing <= priority => return, // coalesce
      _ => {}
    }
    self.queued.insert(path.clone(), priority);
    let band = &mut self.bands[priority.band()];
    if front {
      band.push_front(path);
    } else {
      band.push_back(path);
    }
  }
}

pub struct FileQueue {
  inner: Mutex<Inner>,
  notify: Notify,
}

impl FileQueue {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      inner: Mutex::new(Inner::default()),
      notify: Notify::new(),
    })
  }

  /// Enqueue at the back of the band. A path already queued keeps its
  /// single entry with the better priority; a path in flight gets its
  /// re-enqueue deferred until the current pass finishes.
  pub fn push(&self, path: PathBuf, priority: Priority) {
    self.insert(path, priority, false);
  }

  /// Enqueue at the front of the band (planner surge).
  pub fn push_front(&self, path: PathBuf, priority: Priority) {
    self.insert(path, priority, true);
  }

  fn insert(&self, path: PathBuf, priority: Priority, front: bool) {
    let mut inner = self.inner.lock().expect("queue lock");
    if inner.closed {
      return;
    }
    if let Some(deferred) = inner.in_flight.get_mut(&path) {
      // Keep the better of any previously deferred priority.
      *deferred = Some(match *deferred {
        Some(existing) if existing <= priority => existing,
        _ => priority,
      });
      return;
    }
    inner.enqueue(path, priority, front);
    drop(inner);
    self.notify.notify_waiters();
  }

  /// Pull the next path by priority. Returns `None` once the queue is
  /// closed and empty. The caller must call [`FileQueue::task_done`] when
  /// the file reaches a terminal state.
  pub async fn pop(&self) -> Option<PathBuf> {
    loop {
      // Register as a waiter before checking, so a push between the check
      // and the await is not lost (notify_waiters stores no permit).
      let notified = self.notify.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      {
        let mut inner = self.inner.lock().expect("queue lock");
        for band in 0..Priority::COUNT {
          while let Some(path) = inner.bands[band].pop_front() {
            let live = inner
              .queued
              .get(&path)
              .is_some_and(|priority| priority.band() == band);
            if live {
              inner.queued.remove(&path);
              inner.in_flight.insert(path.clone(), None);
              return Some(path);
            }
            // Stale entry left behind by a priority upgrade.
          }
        }
        if inner.closed {
          return None;
        }
      }
      notified.await;
    }
  }

  /// Mark one popped path as finished. A re-enqueue deferred while the
  /// path was in flight goes live now.
  pub fn task_done(&self, path: &Path) {
    let mut inner = self.inner.lock().expect("queue lock");
    if let Some(deferred) = inner.in_flight.remove(path) {
      if let Some(priority) = deferred
        && !inner.closed
      {
        inner.enqueue(path.to_path_buf(), priority, false);
      }
    }
    drop(inner);
    self.notify.notify_waiters();
  }

  /// Stop accepting work; waiting poppers drain what is queued then get
  /// `None`.
  pub fn close(&self) {
    self.inner.lock().expect("queue lock").closed = true;
    self.notify.notify_waiters();
  }

  pub fn len(&self) -> usize {
    self.inner.lock().expect("queue lock").queued.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn in_flight(&self) -> usize {
    self.inner.lock().expect("queue lock").in_flight.len()
  }

  /// Wait until nothing is queued and nothing is in flight.
  pub async fn drain(&self) {
    loop {
      let notified = self.notify.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      {
        let inner = self.inner.lock().expect("queue lock");
        if inner.queued.is_empty() && inner.in_flight.is_empty() {
          return;
        }
      }
      notified.await;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn pops_by_priority() {
    let queue = FileQueue::new();
    queue.push(PathBuf::from("/m"), Priority::Modified);
    queue.push(PathBuf::from("/n"), Priority::New);
    queue.push(PathBuf::from("/o"), Priority::Outdated);

    assert_eq!(queue.pop().await.unwrap(), PathBuf::from("/o"));
    assert_eq!(queue.pop().await.unwrap(), PathBuf::from("/n"));
    assert_eq!(queue.pop().await.unwrap(), PathBuf::from("/m"));
  }

  #[tokio::test]
  async fn same_path_coalesces_to_one_entry() {
    let queue = FileQueue::new();
    queue.push(PathBuf::from("/a"), Priority::Modified);
    queue.push(PathBuf::from("/a"), Priority::Modified);
    queue.push(PathBuf::from("/a"), Priority::Modified);
    assert_eq!(queue.len(), 1);

    queue.close();
    assert_eq!(queue.pop().await.unwrap(), PathBuf::from("/a"));
    assert_eq!(queue.pop().await, None);
  }

  #[tokio::test]
  async fn reenqueue_upgrades_priority() {
    let queue = FileQueue::new();
    queue.push(PathBuf::from("/a"), Priority::Modified);
    queue.push(PathBuf::from("/b"), Priority::New);
    queue.push(PathBuf::from("/a"), Priority::Outdated);

    assert_eq!(queue.len(), 2, "still one live entry per path");
    assert_eq!(queue.pop().await.unwrap(), PathBuf::from("/a"), "upgraded path serves first");
    assert_eq!(queue.pop().await.unwrap(), PathBuf::from("/b"));
    assert!(queue.is_empty());
  }

  #[tokio::test]
  async fn reenqueue_never_downgrades() {
    let queue = FileQueue::new();
    queue.push(PathBuf::from("/a"), Priority::Outdated);
    queue.push(PathBuf::from("/a"), Priority::Modified);
    queue.push(PathBuf::from("/b"), Priority::New);

    assert_eq!(queue.pop().await.unwrap(), PathBuf::from("/a"));
  }

  #[tokio::test]
  async fn push_front_jumps_its_band() {
    let queue = FileQueue::new();
    queue.push(PathBuf::from("/first"), Priority::New);
    queue.push_front(PathBuf::from("/urgent"), Priority::New);
    assert_eq!(queue.pop().await.unwrap(), PathBuf::from("/urgent"));
  }

  #[tokio::test]
  async fn closed_queue_rejects_new_work() {
    let queue = FileQueue::new();
    queue.close();
    queue.push(PathBuf::from("/late"), Priority::New);
    assert!(queue.is_empty());
    assert_eq!(queue.pop().await, None);
  }

  #[tokio::test]
  async fn reenqueue_while_in_flight_is_deferred() {
    let queue = FileQueue::new();
    queue.push(PathBuf::from("/a"), Priority::New);
    let path = queue.pop().await.unwrap();

    // The same path changes again while a worker holds it.
    queue.push(PathBuf::from("/a"), Priority::Modified);
    assert_eq!(queue.len(), 0, "no second live entry while in flight");

    queue.task_done(&path);
    assert_eq!(queue.len(), 1, "deferred re-enqueue goes live on completion");
    assert_eq!(queue.pop().await.unwrap(), PathBuf::from("/a"));
  }

  #[tokio::test]
  async fn drain_waits_for_in_flight() {
    let queue = FileQueue::new();
    queue.push(PathBuf::from("/a"), Priority::New);
    let popped = queue.pop().await.unwrap();
    assert_eq!(popped, PathBuf::from("/a"));
    assert_eq!(queue.in_flight(), 1);

    let drainer = {
      let queue = queue.clone();
      tokio::spawn(async move { queue.drain().await })
    };
    tokio::task::yield_now().await;
    assert!(!drainer.is_finished(), "drain must wait for the in-flight task");

    queue.task_done(&popped);
    drainer.await.unwrap();
  }

  #[tokio::test]
  async fn pop_blocks_until_push() {
    let queue = FileQueue::new();
    let popper = {
      let queue = queue.clone();
      tokio::spawn(async move { queue.pop().await })
    };
    tokio::task::yield_now().await;
    queue.push(PathBuf::from("/late"), Priority::Modified);
    assert_eq!(popper.await.unwrap().unwrap(), PathBuf::from("/late"));
  }
}
