//! Bounded retry for idempotent client calls. The policy lives here and
//! nowhere else; callers wrap the whole call rather than scattering retry
//! logic through error handlers.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use crate::EmbeddingError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
  /// Total attempts, including the first.
  pub attempts: u32,
  /// Linear backoff unit: attempt n sleeps `n * backoff` before retrying.
  pub backoff: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      attempts: 2,
      backoff: Duration::from_secs(1),
    }
  }
}

impl RetryPolicy {
  pub fn none() -> Self {
    Self {
      attempts: 1,
      backoff: Duration::ZERO,
    }
  }

  /// Run `op` until it succeeds, fails non-retryably, or attempts run out.
  pub async fn run<T, F, Fut>(&self, op: F) -> Result<T, EmbeddingError>
  where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, EmbeddingError>>,
  {
    let mut attempt = 1u32;
    loop {
      match op().await {
        Ok(value) => return Ok(value),
        Err(e) if e.is_retryable() && attempt < self.attempts => {
          let delay = self.backoff * attempt;
          debug!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "Retrying embedder call");
          sleep(delay).await;
          attempt += 1;
        }
        Err(e) => return Err(e),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicU32, Ordering};

  use super::*;

  fn policy() -> RetryPolicy {
    RetryPolicy {
      attempts: 2,
      backoff: Duration::from_millis(1),
    }
  }

  #[tokio::test]
  async fn succeeds_without_retry() {
    let calls = AtomicU32::new(0);
    let result = policy()
      .run(|| {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, EmbeddingError>(42) }
      })
      .await;
    assert_eq!(result.unwrap(), 42);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn retries_transient_failure_once() {
    let calls = AtomicU32::new(0);
    let result = policy()
      .run(|| {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move {
          if n == 0 {
            Err(EmbeddingError::Network("connection reset".into()))
          } else {
            Ok(7)
          }
        }
      })
      .await;
    assert_eq!(result.unwrap(), 7);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn gives_up_after_attempt_budget() {
    let calls = AtomicU32::new(0);
    let result: Result<(), _> = policy()
      .run(|| {
        calls.fetch_add(1, Ordering::SeqCst);
        async {
          Err(EmbeddingError::Http {
            status: 503,
            body: "overloaded".into(),
          })
        }
      })
      .await;
    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 2, "2 attempts total");
  }

  #[tokio::test]
  async fn client_errors_are_not_retried() {
    let calls = AtomicU32::new(0);
    let result: Result<(), _> = policy()
      .run(|| {
        calls.fetch_add(1, Ordering::SeqCst);
        async {
          Err(EmbeddingError::Http {
            status: 422,
            body: "bad input".into(),
          })
        }
      })
      .await;
    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }
}
