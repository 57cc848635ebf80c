//! Recursive discovery of indexable files under the configured roots.
//!
//! Applies the exclusion glob set (built-in defaults merged with user
//! patterns), the enabled file-type set and the per-file size cap. Hidden
//! dotfiles are skipped by the walker itself.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, UNIX_EPOCH};

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use semadex_core::Config;
use tracing::{debug, warn};

use crate::IndexError;

/// One file surviving the exclusion, type and size rules.
#[derive(Debug, Clone)]
pub struct DiscoveredFile {
  pub path: PathBuf,
  pub size: u64,
  /// Modification time, epoch milliseconds.
  pub mtime_ms: i64,
}

#[derive(Debug)]
pub struct ScanResult {
  pub files: Vec<DiscoveredFile>,
  pub skipped: u32,
  pub duration: Duration,
}

pub struct Scanner {
  extensions: HashSet<String>,
  excludes: GlobSet,
  /// Inclusive byte cap: a file exactly at the cap is indexed.
  max_file_size: u64,
}

/// Build the exclusion matcher from glob patterns.
pub fn build_exclude_set(patterns: &[String]) -> Result<GlobSet, IndexError> {
  let mut builder = GlobSetBuilder::new();
  for pattern in patterns {
    match Glob::new(pattern) {
      Ok(glob) => {
        builder.add(glob);
      }
      Err(e) => warn!(pattern = %pattern, error = %e, "Skipping invalid exclude pattern"),
    }
  }
  Ok(builder.build()?)
}

impl Scanner {
  pub fn from_config(config: &Config) -> Result<Self, IndexError> {
    Ok(Self {
      extensions: config.file_types.enabled_extensions(),
      excludes: build_exclude_set(&config.merged_exclude_patterns())?,
      max_file_size: config.max_file_size_bytes(),
    })
  }

  pub fn with_rules(extensions: HashSet<String>, excludes: GlobSet, max_file_size: u64) -> Self {
    Self {
      extensions,
      excludes,
      max_file_size,
    }
  }

  /// Whether a path passes the exclusion and file-type rules. Size is
  /// checked against fresh metadata at scan/index time, not here.
  pub fn admits(&self, path: &Path) -> bool {
    if self.excludes.is_match(path) {
      return false;
    }
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
      return false;
    };
    self.extensions.contains(&ext.to_lowercase())
  }

  /// Recursively enumerate one root.
  pub fn scan(&self, root: &Path) -> ScanResult {
    let start = Instant::now();
    let mut files = Vec::new();
    let mut skipped = 0u32;

    let walker = WalkBuilder::new(root)
      .standard_filters(false)
      .hidden(true) // skip dotfiles and dot-directories
      .follow_links(false)
      .filter_entry({
        let excludes = self.excludes.clone();
        move |entry| !excludes.is_match(entry.path())
      })
      .build();

    for entry in walker {
      let entry = match entry {
        Ok(e) => e,
        Err(e) => {
          warn!(error = %e, "Walk error");
          continue;
        }
      };
      if entry.file_type().is_none_or(|ft| ft.is_dir()) {
        continue;
      }
      let path = entry.path();

      if !self.admits(path) {
        continue;
      }

      let Ok(metadata) = entry.metadata() else {
        skipped += 1;
        continue;
      };
      if metadata.len() > self.max_file_size {
        skipped += 1;
        continue;
      }

      let mtime_ms = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);

      files.push(DiscoveredFile {
        path: path.to_path_buf(),
        size: metadata.len(),
        mtime_ms,
      });
    }

    let duration = start.elapsed();
    debug!(
      root = %root.display(),
      found = files.len(),
      skipped,
      elapsed_ms = duration.as_millis() as u64,
      "Scan complete"
    );

    ScanResult {
      files,
      skipped,
      duration,
    }
  }
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;

  fn scanner_with(config: &Config) -> Scanner {
    Scanner::from_config(config).unwrap()
  }

  #[test]
  fn finds_enabled_types_only() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.txt"), "text").unwrap();
    std::fs::write(dir.path().join("b.md"), "# md").unwrap();
    std::fs::write(dir.path().join("c.exe"), "binary").unwrap();

    let config = Config::default();
    let scanner = scanner_with(&config);
    let result = scanner.scan(dir.path());

    let names: Vec<String> = result
      .files
      .iter()
      .map(|f| f.path.file_name().unwrap().to_string_lossy().to_string())
      .collect();
    assert_eq!(result.files.len(), 2, "found {names:?}");
    assert!(!names.contains(&"c.exe".to_string()));
  }

  #[test]
  fn disabled_type_is_excluded() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.txt"), "text").unwrap();
    std::fs::write(dir.path().join("b.csv"), "a,b").unwrap();

    let mut config = Config::default();
    config.file_types.csv = false;
    let scanner = scanner_with(&config);
    let result = scanner.scan(dir.path());
    assert_eq!(result.files.len(), 1);
    assert!(result.files[0].path.ends_with("a.txt"));
  }

  #[test]
  fn default_excludes_cover_vcs_and_node_modules() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
    std::fs::write(dir.path().join("node_modules/pkg/readme.md"), "skip").unwrap();
    std::fs::write(dir.path().join("keep.md"), "keep").unwrap();

    let config = Config::default();
    let scanner = scanner_with(&config);
    let result = scanner.scan(dir.path());
    assert_eq!(result.files.len(), 1);
    assert!(result.files[0].path.ends_with("keep.md"));
  }

  #[test]
  fn hidden_dotfiles_are_skipped() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(".hidden.txt"), "secret").unwrap();
    std::fs::write(dir.path().join("visible.txt"), "ok").unwrap();

    let config = Config::default();
    let scanner = scanner_with(&config);
    let result = scanner.scan(dir.path());
    assert_eq!(result.files.len(), 1);
    assert!(result.files[0].path.ends_with("visible.txt"));
  }

  #[test]
  fn user_patterns_extend_defaults() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("Archive")).unwrap();
    std::fs::write(dir.path().join("Archive/old.txt"), "old").unwrap();
    std::fs::write(dir.path().join("new.txt"), "new").unwrap();

    let mut config = Config::default();
    config.exclude_patterns.push("**/Archive/**".to_string());
    let scanner = scanner_with(&config);
    let result = scanner.scan(dir.path());
    assert_eq!(result.files.len(), 1);
    assert!(result.files[0].path.ends_with("new.txt"));
  }

  #[test]
  fn size_cap_is_inclusive() {
    let dir = TempDir::new().unwrap();
    let cap = 1024 * 1024; // 1 MB configured below
    std::fs::write(dir.path().join("exact.txt"), vec![b'a'; cap]).unwrap();
    std::fs::write(dir.path().join("over.txt"), vec![b'a'; cap + 1]).unwrap();

    let config = Config {
      max_file_size: 1,
      ..Config::default()
    };
    let scanner = scanner_with(&config);
    let result = scanner.scan(dir.path());
    assert_eq!(result.files.len(), 1, "exactly-at-cap is included");
    assert!(result.files[0].path.ends_with("exact.txt"));
    assert_eq!(result.skipped, 1, "one byte over is excluded");
  }

  #[test]
  fn empty_files_are_discovered() {
    // An empty file flows through so the pipeline can mark it failed
    // with "no text content" rather than silently vanishing.
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("empty.txt"), "").unwrap();

    let config = Config::default();
    let scanner = scanner_with(&config);
    let result = scanner.scan(dir.path());
    assert_eq!(result.files.len(), 1);
  }

  #[test]
  fn admits_checks_extension_and_excludes() {
    let config = Config::default();
    let scanner = scanner_with(&config);
    assert!(scanner.admits(Path::new("/docs/report.TXT")));
    assert!(!scanner.admits(Path::new("/docs/archive.zip")));
    assert!(!scanner.admits(Path::new("/docs/no_extension")));
    assert!(!scanner.admits(Path::new("/repo/.git/notes.txt")));
    assert!(!scanner.admits(Path::new("/Apps/Foo.app/Contents/readme.txt")));
  }
}
