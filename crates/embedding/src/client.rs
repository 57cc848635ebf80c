//! HTTP client for the loopback embedder endpoint.
//!
//! One HTTP request per `embed` call; the pipeline batches above this layer.
//! The sidecar handles its own queueing, so concurrent calls are fine — no
//! serialization happens here.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{Embedder, EmbeddingError, Health, ModelInfo, RetryPolicy};

#[derive(Debug, Clone)]
pub struct HttpEmbedderClient {
  client: reqwest::Client,
  base_url: String,
  dimensions: usize,
  retry: RetryPolicy,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
  texts: &'a [String],
  normalize: bool,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
  vectors: Vec<Vec<f32>>,
}

impl HttpEmbedderClient {
  pub fn new(port: u16, dimensions: usize) -> Self {
    Self::with_timeout(port, dimensions, Duration::from_secs(30))
  }

  pub fn with_timeout(port: u16, dimensions: usize, request_timeout: Duration) -> Self {
    let client = reqwest::Client::builder()
      .timeout(request_timeout)
      .build()
      .expect("reqwest client construction is infallible with these options");
    Self {
      client,
      base_url: format!("http://127.0.0.1:{port}"),
      dimensions,
      retry: RetryPolicy::default(),
    }
  }

  pub fn base_url(&self) -> &str {
    &self.base_url
  }

  fn url(&self, path: &str) -> String {
    format!("{}{path}", self.base_url)
  }

  async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, EmbeddingError> {
    let response = self.client.get(self.url(path)).send().await?;
    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(EmbeddingError::Http {
        status: status.as_u16(),
        body,
      });
    }
    response
      .json::<T>()
      .await
      .map_err(|e| EmbeddingError::Parse(e.to_string()))
  }
}

#[async_trait]
impl Embedder for HttpEmbedderClient {
  async fn embed(&self, texts: &[String], normalize: bool) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    debug!(texts = texts.len(), normalize, "Embedding batch");

    let vectors = self
      .retry
      .run(|| async {
        let request = EmbedRequest { texts, normalize };
        let response = self.client.post(self.url("/embed")).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
          let body = response.text().await.unwrap_or_default();
          warn!(status = status.as_u16(), "Embed request failed");
          return Err(EmbeddingError::Http {
            status: status.as_u16(),
            body,
          });
        }
        let parsed: EmbedResponse = response
          .json()
          .await
          .map_err(|e| EmbeddingError::Parse(e.to_string()))?;
        Ok(parsed.vectors)
      })
      .await?;

    if vectors.len() != texts.len() {
      return Err(EmbeddingError::Parse(format!(
        "expected {} vectors, got {}",
        texts.len(),
        vectors.len()
      )));
    }
    for vector in &vectors {
      if vector.len() != self.dimensions {
        return Err(EmbeddingError::Dimension {
          expected: self.dimensions,
          got: vector.len(),
        });
      }
    }

    Ok(vectors)
  }

  async fn health(&self) -> Result<Health, EmbeddingError> {
    self.retry.run(|| self.get_json::<Health>("/health")).await
  }

  async fn info(&self) -> Result<ModelInfo, EmbeddingError> {
    self.retry.run(|| self.get_json::<ModelInfo>("/info")).await
  }

  fn dimensions(&self) -> usize {
    self.dimensions
  }
}
