//! Vector & status store: two LanceDB tables (`chunks`, `file_status`)
//! behind a declared schema version, with all writes serialized through a
//! bounded queue.

mod chunks;
mod connection;
mod file_status;
mod schema;
mod status_cache;
mod version;
mod write_queue;

pub use chunks::ScoredChunk;
pub use connection::{DbError, Result, Store};
pub use file_status::FailureRow;
pub use status_cache::{CachedStatus, StatusCache};
pub use version::{ensure_schema_version, read_marker, VERSION_MARKER};
pub use write_queue::{spawn_store_writer, DepthGauge, WriteHandle, WriteOp, WriterConfig};
