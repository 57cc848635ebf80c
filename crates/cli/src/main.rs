//! `semadex` — run the indexing core, one-shot index, search, or inspect
//! file statuses from the terminal.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use daemon::CoreBuilder;
use db::Store;
use semadex_core::{Config, UiEvent, DB_VERSION, DIM};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "semadex", about = "Local semantic document search core", version)]
struct Cli {
  /// Data directory (store, marker, config.json)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Run the core with the filesystem watcher until interrupted
  Run,
  /// Index the configured folders once and exit
  Index,
  /// Search the index
  Search {
    query: String,
    /// Number of results
    #[arg(short = 'k', long, default_value_t = 10)]
    limit: usize,
  },
  /// Show file status records
  Status {
    /// Restrict to one path
    path: Option<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .init();

  let cli = Cli::parse();
  let data_root = cli.data_dir.unwrap_or_else(Config::default_data_root);

  match cli.command {
    Commands::Run => run(data_root, true).await,
    Commands::Index => run(data_root, false).await,
    Commands::Search { query, limit } => search(data_root, &query, limit).await,
    Commands::Status { path } => status(data_root, path).await,
  }
}

fn progress_printer() -> mpsc::Sender<UiEvent> {
  let (tx, mut rx) = mpsc::channel::<UiEvent>(32);
  tokio::spawn(async move {
    while let Some(event) = rx.recv().await {
      match &event {
        UiEvent::StartupStage { message, progress, .. } => {
          eprintln!("[{progress:>5.1}%] {message}");
        }
        UiEvent::StartupError { code, message, .. } => {
          eprintln!("startup error {code}: {message}");
        }
      }
    }
  });
  tx
}

async fn run(data_root: PathBuf, watch: bool) -> Result<()> {
  let mut builder = CoreBuilder::new(&data_root).with_events(progress_printer());
  if !watch {
    builder = builder.without_watcher();
  }
  let core = builder.start().await?;

  if watch {
    info!("Watching; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
  } else {
    core.wait_idle().await;
    info!("Index up to date");
  }

  core.shutdown().await;
  Ok(())
}

async fn search(data_root: PathBuf, query: &str, limit: usize) -> Result<()> {
  let core = CoreBuilder::new(&data_root).without_watcher().start().await?;
  let hits = core.search(query, limit).await?;

  if hits.is_empty() {
    println!("no results");
  }
  for hit in &hits {
    println!("{:.3}  {}  (page {}, chunk {})", hit.score, hit.path, hit.page, hit.chunk_index);
    let preview: String = hit.text.chars().take(160).collect();
    println!("       {}", preview.replace('\n', " "));
  }

  core.shutdown().await;
  Ok(())
}

async fn status(data_root: PathBuf, path: Option<String>) -> Result<()> {
  let (store, _) = Store::open(&data_root, DIM, DB_VERSION).await?;

  match path {
    Some(path) => match store.get_file_status(&path).await? {
      Some(record) => {
        println!(
          "{}  {}  parser v{}  chunks {}  {}",
          record.path, record.status, record.parser_version, record.chunk_count, record.error_message
        );
      }
      None => println!("no record for {path}"),
    },
    None => {
      let mut records = store.load_all_statuses().await?;
      records.sort_by(|a, b| a.path.cmp(&b.path));
      for record in records {
        println!(
          "{}  {}  parser v{}  chunks {}  {}",
          record.path, record.status, record.parser_version, record.chunk_count, record.error_message
        );
      }
    }
  }

  Ok(())
}
