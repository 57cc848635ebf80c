//! Memory discipline: RSS sampling and the adaptive worker gate.
//!
//! Above the threshold the gate lowers concurrency to the throttled value;
//! it restores the full value once RSS recedes. Platforms without a cheap
//! RSS source simply never throttle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Resident set size of this process, when the platform exposes it cheaply.
#[cfg(target_os = "linux")]
pub fn rss_bytes() -> Option<u64> {
  let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
  let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
  Some(resident_pages * 4096)
}

#[cfg(not(target_os = "linux"))]
pub fn rss_bytes() -> Option<u64> {
  None
}

/// Concurrency gate the file workers pass through. The limit can shrink
/// while slots are held; holders finish their file and simply fail to
/// re-acquire until the gate widens again. A limit of zero pauses the
/// pipeline entirely (sustained memory breach).
pub struct WorkerGate {
  limit: AtomicUsize,
  active: AtomicUsize,
  notify: Notify,
}

impl WorkerGate {
  pub fn new(limit: usize) -> Arc<Self> {
    Arc::new(Self {
      limit: AtomicUsize::new(limit.max(1)),
      active: AtomicUsize::new(0),
      notify: Notify::new(),
    })
  }

  pub fn limit(&self) -> usize {
    self.limit.load(Ordering::Acquire)
  }

  pub fn active(&self) -> usize {
    self.active.load(Ordering::Acquire)
  }

  pub fn set_limit(&self, limit: usize) {
    self.limit.store(limit, Ordering::Release);
    self.notify.notify_waiters();
  }

  pub async fn acquire(self: &Arc<Self>) -> GateSlot {
    loop {
      // Register before checking so a slot freed in between is not lost.
      let notified = self.notify.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      let active = self.active.load(Ordering::Acquire);
      if active < self.limit() {
        if self
          .active
          .compare_exchange(active, active + 1, Ordering::AcqRel, Ordering::Acquire)
          .is_ok()
        {
          return GateSlot { gate: self.clone() };
        }
        continue; // lost the race, try again immediately
      }
      notified.await;
    }
  }
}

pub struct GateSlot {
  gate: Arc<WorkerGate>,
}

impl Drop for GateSlot {
  fn drop(&mut self) {
    self.gate.active.fetch_sub(1, Ordering::AcqRel);
    self.gate.notify.notify_waiters();
  }
}

#[derive(Debug, Clone)]
pub struct MemoryMonitorConfig {
  /// Above this, worker concurrency drops to the throttled value.
  pub throttle_bytes: u64,
  /// Soft RSS target for the whole process; a sustained breach pauses the
  /// pipeline until RSS recedes.
  pub pause_bytes: u64,
  /// Consecutive over-pause samples before pausing.
  pub sustained_samples: u32,
  pub full_workers: usize,
  pub throttled_workers: usize,
  pub interval: Duration,
}

/// Periodically sample RSS and resize the gate.
pub fn spawn_memory_monitor(
  gate: Arc<WorkerGate>,
  config: MemoryMonitorConfig,
  cancel: CancellationToken,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut over_pause = 0u32;
    loop {
      tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(config.interval) => {}
      }

      let Some(rss) = rss_bytes() else {
        // No RSS source on this platform; nothing to do.
        return;
      };

      over_pause = if rss > config.pause_bytes { over_pause + 1 } else { 0 };

      let target = if over_pause >= config.sustained_samples {
        0
      } else if rss > config.throttle_bytes {
        config.throttled_workers
      } else {
        config.full_workers
      };

      if gate.limit() != target {
        if target < gate.limit() {
          warn!(rss_mb = rss / (1024 * 1024), workers = target, "Memory pressure, reducing workers");
        } else {
          info!(rss_mb = rss / (1024 * 1024), workers = target, "Memory pressure receded, restoring workers");
        }
        gate.set_limit(target);
      }
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn gate_enforces_limit() {
    let gate = WorkerGate::new(2);
    let a = gate.acquire().await;
    let _b = gate.acquire().await;
    assert_eq!(gate.active(), 2);

    let waiter = {
      let gate = gate.clone();
      tokio::spawn(async move {
        let _slot = gate.acquire().await;
      })
    };
    tokio::task::yield_now().await;
    assert!(!waiter.is_finished(), "third acquire must wait");

    drop(a);
    waiter.await.unwrap();
  }

  #[tokio::test]
  async fn shrinking_limit_blocks_new_slots() {
    let gate = WorkerGate::new(4);
    let held = gate.acquire().await;
    gate.set_limit(1);

    let waiter = {
      let gate = gate.clone();
      tokio::spawn(async move {
        let _slot = gate.acquire().await;
      })
    };
    tokio::task::yield_now().await;
    assert!(!waiter.is_finished(), "gate shrank below active count");

    drop(held);
    waiter.await.unwrap();
  }

  #[tokio::test]
  async fn zero_limit_pauses_until_resumed() {
    let gate = WorkerGate::new(4);
    gate.set_limit(0);

    let waiter = {
      let gate = gate.clone();
      tokio::spawn(async move {
        let _slot = gate.acquire().await;
      })
    };
    tokio::task::yield_now().await;
    assert!(!waiter.is_finished(), "paused gate must admit nobody");

    gate.set_limit(2);
    waiter.await.unwrap();
  }

  #[cfg(target_os = "linux")]
  #[test]
  fn rss_is_readable_on_linux() {
    let rss = rss_bytes().expect("statm should be readable");
    assert!(rss > 0);
  }
}
