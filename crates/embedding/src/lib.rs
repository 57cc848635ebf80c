//! Embedding subsystem: the HTTP client speaking to the local sidecar and
//! the service owning the sidecar's lifetime.

mod client;
pub mod progress;
mod retry;
mod sidecar;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use client::HttpEmbedderClient;
pub use progress::{parse_progress_line, SidecarEvent, PROGRESS_PREFIX};
pub use retry::RetryPolicy;
pub use sidecar::{SidecarService, SidecarSettings, SidecarState, SidecarStatus};

#[derive(Error, Debug)]
pub enum EmbeddingError {
  #[error("Network error: {0}")]
  Network(String),
  #[error("Request timed out after {0:?}")]
  Timeout(Duration),
  #[error("HTTP {status}: {body}")]
  Http { status: u16, body: String },
  #[error("Response parse error: {0}")]
  Parse(String),
  #[error("Unexpected vector dimension: expected {expected}, got {got}")]
  Dimension { expected: usize, got: usize },
  #[error("Sidecar error: {0}")]
  Sidecar(String),
}

impl EmbeddingError {
  /// Network-level errors and 5xx responses may be retried; 4xx never is.
  pub fn is_retryable(&self) -> bool {
    match self {
      EmbeddingError::Network(_) | EmbeddingError::Timeout(_) => true,
      EmbeddingError::Http { status, .. } => *status >= 500,
      _ => false,
    }
  }

  pub fn code(&self) -> semadex_core::ErrorCode {
    use semadex_core::ErrorCode;
    match self {
      EmbeddingError::Network(_) => ErrorCode::NetworkError,
      EmbeddingError::Timeout(_) => ErrorCode::Timeout,
      EmbeddingError::Http { .. } => ErrorCode::HttpError,
      EmbeddingError::Parse(_) | EmbeddingError::Dimension { .. } => ErrorCode::ParseError,
      EmbeddingError::Sidecar(_) => ErrorCode::SidecarNotHealthy,
    }
  }
}

impl From<reqwest::Error> for EmbeddingError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      EmbeddingError::Timeout(Duration::from_secs(0))
    } else if e.is_decode() {
      EmbeddingError::Parse(e.to_string())
    } else {
      EmbeddingError::Network(e.to_string())
    }
  }
}

/// `GET /health` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
  pub status: String,
  pub model: String,
  pub dim: usize,
  pub device: String,
}

/// `GET /info` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
  pub model_id: String,
  pub dim: usize,
  pub device: String,
  pub version: String,
}

/// The embedding seam. Implemented by [`HttpEmbedderClient`] against the
/// sidecar, and by in-memory fakes in tests.
#[async_trait]
pub trait Embedder: Send + Sync {
  /// Embed a batch of texts. Vectors come back strictly in request order;
  /// callers pair them to inputs by position.
  async fn embed(&self, texts: &[String], normalize: bool) -> Result<Vec<Vec<f32>>, EmbeddingError>;

  async fn health(&self) -> Result<Health, EmbeddingError>;

  async fn info(&self) -> Result<ModelInfo, EmbeddingError>;

  fn dimensions(&self) -> usize;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn retryable_classification() {
    assert!(EmbeddingError::Network("reset".into()).is_retryable());
    assert!(EmbeddingError::Timeout(Duration::from_secs(30)).is_retryable());
    assert!(
      EmbeddingError::Http {
        status: 503,
        body: String::new()
      }
      .is_retryable()
    );
    assert!(
      !EmbeddingError::Http {
        status: 400,
        body: String::new()
      }
      .is_retryable(),
      "4xx must not be retried"
    );
    assert!(!EmbeddingError::Parse("bad json".into()).is_retryable());
  }

  #[test]
  fn error_codes_map_to_taxonomy() {
    use semadex_core::ErrorCode;
    assert_eq!(EmbeddingError::Network("x".into()).code(), ErrorCode::NetworkError);
    assert_eq!(
      EmbeddingError::Timeout(Duration::from_secs(1)).code(),
      ErrorCode::Timeout
    );
    assert_eq!(
      EmbeddingError::Http {
        status: 500,
        body: String::new()
      }
      .code(),
      ErrorCode::HttpError
    );
    assert_eq!(
      EmbeddingError::Dimension { expected: 768, got: 384 }.code(),
      ErrorCode::ParseError
    );
  }
}
