//! Chunk table operations: batched append, delete-by-path, cosine search.

use std::sync::Arc;

use arrow_array::{
  Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray, UInt32Array,
};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::DistanceType;
use semadex_core::ChunkRecord;
use tracing::debug;

use crate::{
  connection::{escape_sql, DbError, Result, Store},
  schema::chunks_schema,
};

/// A chunk returned from vector search with its similarity score,
/// `max(0, 1 - cosine_distance)`.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
  pub chunk: ChunkRecord,
  pub score: f32,
}

impl Store {
  /// Append a batch of chunks with their vectors, paired by position.
  #[tracing::instrument(level = "trace", skip(self, chunks, vectors), fields(batch_size = chunks.len()))]
  pub async fn add_chunks(&self, chunks: &[ChunkRecord], vectors: &[Vec<f32>]) -> Result<()> {
    if chunks.is_empty() {
      return Ok(());
    }
    if chunks.len() != vectors.len() {
      return Err(DbError::InvalidInput(format!(
        "chunk/vector count mismatch: {} vs {}",
        chunks.len(),
        vectors.len()
      )));
    }
    for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
      if chunk.text.is_empty() {
        return Err(DbError::InvalidInput(format!("empty chunk text for {}", chunk.id)));
      }
      if vector.len() != self.vector_dim {
        return Err(DbError::InvalidInput(format!(
          "vector dimension {} for {}, expected {}",
          vector.len(),
          chunk.id,
          self.vector_dim
        )));
      }
    }

    debug!(
      table = "chunks",
      operation = "batch_insert",
      batch_size = chunks.len(),
      "Adding chunk batch"
    );

    let table = self.chunks_table().await?;
    let batch = chunks_to_batch(chunks, vectors, self.vector_dim)?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], chunks_schema(self.vector_dim));
    table.add(Box::new(batches)).execute().await?;
    Ok(())
  }

  /// Delete every chunk belonging to `path`.
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn delete_chunks_for_path(&self, path: &str) -> Result<()> {
    let table = self.chunks_table().await?;
    table.delete(&format!("path = '{}'", escape_sql(path))).await?;
    Ok(())
  }

  /// Top-k cosine search with an optional SQL filter.
  #[tracing::instrument(level = "trace", skip(self, query_vector))]
  pub async fn search_chunks(
    &self,
    query_vector: &[f32],
    limit: usize,
    filter: Option<&str>,
  ) -> Result<Vec<ScoredChunk>> {
    if query_vector.len() != self.vector_dim {
      return Err(DbError::InvalidInput(format!(
        "query dimension {}, expected {}",
        query_vector.len(),
        self.vector_dim
      )));
    }

    let table = self.chunks_table().await?;

    let query = table
      .vector_search(query_vector.to_vec())?
      .distance_type(DistanceType::Cosine)
      .limit(limit);
    let query = match filter {
      Some(f) => query.only_if(f),
      None => query,
    };

    let results: Vec<RecordBatch> = query.execute().await?.try_collect().await?;

    let mut hits = Vec::new();
    for batch in results {
      for i in 0..batch.num_rows() {
        let chunk = batch_to_chunk(&batch, i)?;
        let distance = batch
          .column_by_name("_distance")
          .and_then(|col| col.as_any().downcast_ref::<Float32Array>())
          .map(|arr| arr.value(i))
          .unwrap_or(0.0);
        hits.push(ScoredChunk {
          chunk,
          score: (1.0 - distance).max(0.0),
        });
      }
    }

    debug!(table = "chunks", operation = "search", results = hits.len(), "Search complete");
    Ok(hits)
  }

  /// Chunks for one path, ordered by `chunk_index`.
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn chunks_for_path(&self, path: &str) -> Result<Vec<ChunkRecord>> {
    let table = self.chunks_table().await?;
    let results: Vec<RecordBatch> = table
      .query()
      .only_if(format!("path = '{}'", escape_sql(path)))
      .execute()
      .await?
      .try_collect()
      .await?;

    let mut chunks = Vec::new();
    for batch in results {
      for i in 0..batch.num_rows() {
        chunks.push(batch_to_chunk(&batch, i)?);
      }
    }
    chunks.sort_by_key(|c| c.chunk_index);
    Ok(chunks)
  }

  pub async fn count_chunks(&self) -> Result<usize> {
    let table = self.chunks_table().await?;
    Ok(table.count_rows(None).await?)
  }

  /// Opportunistically (re)build the ANN index when the store is idle.
  /// Not required for correctness; small tables stay brute-force.
  pub async fn build_vector_index(&self) -> Result<bool> {
    let table = self.chunks_table().await?;
    let rows = table.count_rows(None).await?;
    if rows < 256 {
      return Ok(false);
    }
    table
      .create_index(&["vector"], lancedb::index::Index::Auto)
      .execute()
      .await?;
    debug!(rows, "Vector index rebuilt");
    Ok(true)
  }
}

/// Convert chunk records and vectors into one Arrow RecordBatch.
fn chunks_to_batch(chunks: &[ChunkRecord], vectors: &[Vec<f32>], vector_dim: usize) -> Result<RecordBatch> {
  let ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
  let paths: Vec<String> = chunks.iter().map(|c| c.path.clone()).collect();
  let chunk_indexes: Vec<u32> = chunks.iter().map(|c| c.chunk_index).collect();
  let pages: Vec<u32> = chunks.iter().map(|c| c.page).collect();
  let offsets: Vec<u32> = chunks.iter().map(|c| c.offset).collect();
  let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
  let titles: Vec<String> = chunks.iter().map(|c| c.title.clone()).collect();
  let types: Vec<String> = chunks.iter().map(|c| c.doc_type.clone()).collect();
  let mtimes: Vec<i64> = chunks.iter().map(|c| c.mtime).collect();

  let flat: Vec<f32> = vectors.iter().flat_map(|v| v.iter().copied()).collect();
  let values = Float32Array::from(flat);
  let field = Arc::new(arrow_schema::Field::new("item", arrow_schema::DataType::Float32, true));
  let vector_list = FixedSizeListArray::try_new(field, vector_dim as i32, Arc::new(values), None)?;

  let batch = RecordBatch::try_new(
    chunks_schema(vector_dim),
    vec![
      Arc::new(StringArray::from(ids)),
      Arc::new(StringArray::from(paths)),
      Arc::new(UInt32Array::from(chunk_indexes)),
      Arc::new(UInt32Array::from(pages)),
      Arc::new(UInt32Array::from(offsets)),
      Arc::new(StringArray::from(texts)),
      Arc::new(StringArray::from(titles)),
      Arc::new(StringArray::from(types)),
      Arc::new(Int64Array::from(mtimes)),
      Arc::new(vector_list),
    ],
  )?;

  Ok(batch)
}

fn string_column(batch: &RecordBatch, name: &str, row: usize) -> Result<String> {
  batch
    .column_by_name(name)
    .and_then(|c| c.as_any().downcast_ref::<StringArray>())
    .map(|a| a.value(row).to_string())
    .ok_or_else(|| DbError::NotFound(format!("{name} column")))
}

fn u32_column(batch: &RecordBatch, name: &str, row: usize) -> Result<u32> {
  batch
    .column_by_name(name)
    .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
    .map(|a| a.value(row))
    .ok_or_else(|| DbError::NotFound(format!("{name} column")))
}

/// Convert a RecordBatch row to a ChunkRecord
fn batch_to_chunk(batch: &RecordBatch, row: usize) -> Result<ChunkRecord> {
  let mtime = batch
    .column_by_name("mtime")
    .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
    .map(|a| a.value(row))
    .ok_or_else(|| DbError::NotFound("mtime column".to_string()))?;

  Ok(ChunkRecord {
    id: string_column(batch, "id", row)?,
    path: string_column(batch, "path", row)?,
    chunk_index: u32_column(batch, "chunk_index", row)?,
    page: u32_column(batch, "page", row)?,
    offset: u32_column(batch, "offset", row)?,
    text: string_column(batch, "text", row)?,
    title: string_column(batch, "title", row)?,
    doc_type: string_column(batch, "type", row)?,
    mtime,
  })
}
