//! File discovery, decoding and chunking: the scanner, watcher, parser
//! registry, chunker and the startup re-index planner.

pub mod chunker;
pub mod debounce;
pub mod parsers;
pub mod planner;
pub mod scanner;
pub mod watcher;

use thiserror::Error;

pub use chunker::{Chunker, ChunkerConfig, TextChunk};
pub use debounce::{DebounceConfig, DebouncedWatcher};
pub use parsers::{Decoded, DecodeError, Decoder, Page, ParserRegistry};
pub use planner::{plan_reindex, PlanOutcome};
pub use scanner::{DiscoveredFile, ScanResult, Scanner};
pub use watcher::{FileEvent, FileEventKind, FileWatcher};

#[derive(Error, Debug)]
pub enum IndexError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Walk error: {0}")]
  Walk(#[from] ignore::Error),
  #[error("Glob error: {0}")]
  Glob(#[from] globset::Error),
  #[error("Notify error: {0}")]
  Notify(#[from] notify::Error),
  #[error("Decode error: {0}")]
  Decode(#[from] parsers::DecodeError),
}
