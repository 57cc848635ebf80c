//! User configuration, persisted as `config.json` in the data directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Exclusion defaults applied on top of user patterns: VCS metadata, package
/// and build trees, platform bundles, media libraries.
pub const DEFAULT_EXCLUDES: &[&str] = &[
  "**/.git/**",
  "**/.svn/**",
  "**/.hg/**",
  "**/node_modules/**",
  "**/target/**",
  "**/build/**",
  "**/dist/**",
  "**/DerivedData/**",
  "**/*.app/**",
  "**/*.framework/**",
  "**/*.photoslibrary/**",
  "**/*.musiclibrary/**",
  "**/*.aplibrary/**",
];

/// Per-extension gates applied at scan time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileTypes {
  pub pdf: bool,
  pub txt: bool,
  pub md: bool,
  pub docx: bool,
  pub doc: bool,
  pub rtf: bool,
  pub csv: bool,
  pub tsv: bool,
  pub xlsx: bool,
  pub xls: bool,
  pub xlsm: bool,
}

impl Default for FileTypes {
  fn default() -> Self {
    Self {
      pdf: true,
      txt: true,
      md: true,
      docx: true,
      doc: true,
      rtf: true,
      csv: true,
      tsv: true,
      xlsx: true,
      xls: true,
      xlsm: true,
    }
  }
}

impl FileTypes {
  /// Lowercase extensions currently enabled.
  pub fn enabled_extensions(&self) -> HashSet<String> {
    let pairs: [(&str, bool); 11] = [
      ("pdf", self.pdf),
      ("txt", self.txt),
      ("md", self.md),
      ("docx", self.docx),
      ("doc", self.doc),
      ("rtf", self.rtf),
      ("csv", self.csv),
      ("tsv", self.tsv),
      ("xlsx", self.xlsx),
      ("xls", self.xls),
      ("xlsm", self.xlsm),
    ];
    pairs
      .iter()
      .filter(|(_, enabled)| *enabled)
      .map(|(ext, _)| ext.to_string())
      .collect()
  }
}

/// Embedding sidecar launch settings. The subprocess binds loopback only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
  /// Runtime executable used to launch the sidecar.
  pub command: String,
  /// Arguments passed to the runtime (script path etc.).
  pub args: Vec<String>,
  /// Fixed loopback port the sidecar listens on.
  pub port: u16,
  /// Directory of a bundled runtime, prepended to PATH when set.
  pub runtime_dir: Option<PathBuf>,
  /// Modules the stage-2 pre-flight verifies are importable.
  pub preflight_imports: Vec<String>,
  pub startup_timeout_secs: u64,
  pub shutdown_timeout_secs: u64,
  pub request_timeout_secs: u64,
}

impl Default for SidecarConfig {
  fn default() -> Self {
    Self {
      command: "python3".to_string(),
      args: vec!["-m".to_string(), "semadex_embedder".to_string()],
      port: 8421,
      runtime_dir: None,
      preflight_imports: vec!["fastembed".to_string(), "uvicorn".to_string()],
      startup_timeout_secs: 30,
      shutdown_timeout_secs: 5,
      request_timeout_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Roots to scan and watch.
  pub watched_folders: Vec<PathBuf>,
  pub file_types: FileTypes,
  /// User glob patterns, merged with [`DEFAULT_EXCLUDES`].
  pub exclude_patterns: Vec<String>,
  /// Per-file size cap in megabytes (inclusive).
  pub max_file_size: u64,
  /// Hint for the PDF decoder to OCR likely-scanned documents.
  pub enable_ocr: bool,
  pub sidecar: SidecarConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      watched_folders: Vec::new(),
      file_types: FileTypes::default(),
      exclude_patterns: Vec::new(),
      max_file_size: 50,
      enable_ocr: false,
      sidecar: SidecarConfig::default(),
    }
  }
}

impl Config {
  /// Per-user data directory holding the store, marker and config.
  pub fn default_data_root() -> PathBuf {
    dirs::data_dir()
      .unwrap_or_else(|| PathBuf::from("."))
      .join("semadex")
  }

  pub fn config_path(data_root: &Path) -> PathBuf {
    data_root.join("config.json")
  }

  /// Load from `config.json` under `data_root`; defaults when absent.
  pub fn load(data_root: &Path) -> Result<Config> {
    let path = Self::config_path(data_root);
    if !path.exists() {
      return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(&path)?;
    serde_json::from_str(&raw).map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))
  }

  pub fn save(&self, data_root: &Path) -> Result<()> {
    std::fs::create_dir_all(data_root)?;
    let raw =
      serde_json::to_string_pretty(self).map_err(|e| CoreError::Config(format!("serialize config: {e}")))?;
    std::fs::write(Self::config_path(data_root), raw)?;
    Ok(())
  }

  /// Size cap in bytes. A file exactly at the cap is included.
  pub fn max_file_size_bytes(&self) -> u64 {
    self.max_file_size * 1024 * 1024
  }

  /// User patterns merged with the built-in defaults.
  pub fn merged_exclude_patterns(&self) -> Vec<String> {
    let mut patterns: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    patterns.extend(self.exclude_patterns.iter().cloned());
    patterns
  }
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;

  #[test]
  fn defaults_enable_all_types() {
    let config = Config::default();
    let exts = config.file_types.enabled_extensions();
    assert_eq!(exts.len(), 11);
    assert!(exts.contains("pdf"));
    assert!(exts.contains("xlsm"));
  }

  #[test]
  fn load_missing_file_yields_defaults() {
    let dir = TempDir::new().unwrap();
    let config = Config::load(dir.path()).unwrap();
    assert!(config.watched_folders.is_empty());
    assert_eq!(config.max_file_size, 50);
  }

  #[test]
  fn save_and_reload_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.watched_folders.push(PathBuf::from("/home/user/Documents"));
    config.file_types.xls = false;
    config.exclude_patterns.push("**/Archive/**".to_string());
    config.max_file_size = 25;
    config.save(dir.path()).unwrap();

    let loaded = Config::load(dir.path()).unwrap();
    assert_eq!(loaded.watched_folders, config.watched_folders);
    assert!(!loaded.file_types.xls);
    assert_eq!(loaded.exclude_patterns, vec!["**/Archive/**".to_string()]);
    assert_eq!(loaded.max_file_size, 25);
  }

  #[test]
  fn unknown_fields_are_ignored() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
      Config::config_path(dir.path()),
      r#"{"max_file_size": 10, "some_future_field": true}"#,
    )
    .unwrap();
    let config = Config::load(dir.path()).unwrap();
    assert_eq!(config.max_file_size, 10);
  }

  #[test]
  fn merged_excludes_keep_defaults_first() {
    let mut config = Config::default();
    config.exclude_patterns.push("**/Scans/**".to_string());
    let merged = config.merged_exclude_patterns();
    assert!(merged.len() > DEFAULT_EXCLUDES.len());
    assert_eq!(merged.last().unwrap(), "**/Scans/**");
    assert!(merged.iter().any(|p| p.contains(".git")));
  }

  #[test]
  fn size_cap_is_in_megabytes() {
    let config = Config {
      max_file_size: 2,
      ..Config::default()
    };
    assert_eq!(config.max_file_size_bytes(), 2 * 1024 * 1024);
  }
}
