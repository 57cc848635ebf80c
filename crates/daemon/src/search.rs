//! Query path: embed the query, cosine top-k over the chunks table.

use tracing::debug;

use crate::{CoreContext, LifecycleError};

#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchHit {
  /// `max(0, 1 - cosine_distance)`.
  pub score: f32,
  pub path: String,
  pub page: u32,
  pub chunk_index: u32,
  pub title: String,
  pub text: String,
}

pub async fn search(ctx: &CoreContext, query: &str, limit: usize) -> Result<Vec<SearchHit>, LifecycleError> {
  let vectors = ctx.embedder.embed(&[query.to_string()], true).await?;
  let query_vector = vectors.into_iter().next().unwrap_or_default();

  let hits = ctx.store.search_chunks(&query_vector, limit, None).await?;
  debug!(query_len = query.len(), hits = hits.len(), "Search complete");

  Ok(
    hits
      .into_iter()
      .map(|scored| SearchHit {
        score: scored.score,
        path: scored.chunk.path,
        page: scored.chunk.page,
        chunk_index: scored.chunk.chunk_index,
        title: scored.chunk.title,
        text: scored.chunk.text,
      })
      .collect(),
  )
}
