//! Explicit dependency bundle threaded through the subsystems instead of
//! module-level state.

use std::sync::Arc;

use db::{StatusCache, Store, WriteHandle};
use embedding::Embedder;
use index::ParserRegistry;
use semadex_core::Config;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct CoreContext {
  pub config: Arc<Config>,
  pub store: Arc<Store>,
  pub writer: WriteHandle,
  pub status_cache: Arc<StatusCache>,
  pub registry: Arc<ParserRegistry>,
  pub embedder: Arc<dyn Embedder>,
  pub cancel: CancellationToken,
}
