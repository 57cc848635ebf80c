//! Core lifecycle: staged startup, steady-state operation, ordered
//! shutdown, plus the search and file-status APIs exposed to the shell.

mod context;
mod lifecycle;
mod scheduler;
mod search;
mod shutdown;
mod startup;

use thiserror::Error;

pub use context::CoreContext;
pub use lifecycle::{Core, CoreBuilder};
pub use search::SearchHit;
pub use shutdown::{spawn_watchdog, ShutdownConfig};
pub use startup::StartupCoordinator;

#[derive(Error, Debug)]
pub enum LifecycleError {
  #[error(transparent)]
  Core(#[from] semadex_core::CoreError),
  #[error("Store error: {0}")]
  Db(#[from] db::DbError),
  #[error("Embedding error: {0}")]
  Embedding(#[from] embedding::EmbeddingError),
  #[error("Index error: {0}")]
  Index(#[from] index::IndexError),
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
}
