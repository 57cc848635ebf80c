use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema};

/// Schema for the chunks table
pub fn chunks_schema(vector_dim: usize) -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("id", DataType::Utf8, false),
    Field::new("path", DataType::Utf8, false),
    Field::new("chunk_index", DataType::UInt32, false),
    Field::new("page", DataType::UInt32, false), // 1-based, 0 = inapplicable
    Field::new("offset", DataType::UInt32, false),
    Field::new("text", DataType::Utf8, false),
    Field::new("title", DataType::Utf8, false),
    Field::new("type", DataType::Utf8, false), // lowercase extension
    Field::new("mtime", DataType::Int64, false), // epoch ms at indexing
    Field::new(
      "vector",
      DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), vector_dim as i32),
      false,
    ),
  ]))
}

/// Schema for the file_status table. All nine fields are required on every
/// upsert; empty strings stand in for nullable sentinels.
pub fn file_status_schema() -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("path", DataType::Utf8, false),
    Field::new("status", DataType::Utf8, false),
    Field::new("parser_version", DataType::UInt32, false),
    Field::new("chunk_count", DataType::UInt32, false),
    Field::new("error_message", DataType::Utf8, false),
    Field::new("last_modified", DataType::Int64, false), // epoch ms
    Field::new("indexed_at", DataType::Int64, false),    // epoch ms, 0 = never
    Field::new("file_hash", DataType::Utf8, false),
    Field::new("last_retry", DataType::Utf8, false), // RFC 3339, "" = never
  ]))
}
