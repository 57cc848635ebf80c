//! Parser registry: `extension → (decoder, version)`.
//!
//! The text family (txt, md, csv, tsv, rtf) is decoded in-process. The
//! heavyweight binary formats (pdf, docx, xlsx, ...) are external
//! capabilities registered through the same seam; the core never links them.
//! Bumping a decoder's version retroactively re-indexes files indexed with
//! an older one.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

pub const TXT_PARSER_VERSION: u32 = 4;
pub const MD_PARSER_VERSION: u32 = 4;
pub const CSV_PARSER_VERSION: u32 = 2;
pub const RTF_PARSER_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum DecodeError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Malformed document: {0}")]
  Malformed(String),
}

/// One logical page of extracted text.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
  /// 1-based page number.
  pub number: u32,
  pub text: String,
}

/// Decoder output: paged text when the format has pages, one blob otherwise.
/// The chunker accepts both shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
  Text(String),
  Pages(Vec<Page>),
}

impl Decoded {
  /// Total extracted character count, for empty-document detection.
  pub fn char_count(&self) -> usize {
    match self {
      Decoded::Text(text) => text.trim().chars().count(),
      Decoded::Pages(pages) => pages.iter().map(|p| p.text.trim().chars().count()).sum(),
    }
  }
}

/// An opaque decoding capability. Decoders run on the blocking pool; they
/// are free to do synchronous IO.
pub trait Decoder: Send + Sync {
  fn decode(&self, path: &Path) -> Result<Decoded, DecodeError>;
}

#[derive(Clone, Default)]
pub struct ParserRegistry {
  decoders: HashMap<String, (Arc<dyn Decoder>, u32)>,
}

impl ParserRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registry with the built-in text-family decoders.
  pub fn builtin() -> Self {
    let mut registry = Self::new();
    registry.register("txt", Arc::new(PlainTextDecoder), TXT_PARSER_VERSION);
    registry.register("md", Arc::new(PlainTextDecoder), MD_PARSER_VERSION);
    registry.register("csv", Arc::new(DelimitedTextDecoder { delimiter: ',' }), CSV_PARSER_VERSION);
    registry.register("tsv", Arc::new(DelimitedTextDecoder { delimiter: '\t' }), CSV_PARSER_VERSION);
    registry.register("rtf", Arc::new(RtfDecoder), RTF_PARSER_VERSION);
    registry
  }

  /// Register or replace the decoder for an extension (stored lowercase).
  pub fn register(&mut self, extension: &str, decoder: Arc<dyn Decoder>, version: u32) {
    self.decoders.insert(extension.to_lowercase(), (decoder, version));
  }

  pub fn get(&self, extension: &str) -> Option<(Arc<dyn Decoder>, u32)> {
    self.decoders.get(&extension.to_lowercase()).cloned()
  }

  pub fn version(&self, extension: &str) -> Option<u32> {
    self.decoders.get(&extension.to_lowercase()).map(|(_, v)| *v)
  }

  pub fn supported_extensions(&self) -> Vec<String> {
    let mut extensions: Vec<String> = self.decoders.keys().cloned().collect();
    extensions.sort();
    extensions
  }
}

/// txt / md: raw text, lossily decoded.
struct PlainTextDecoder;

impl Decoder for PlainTextDecoder {
  fn decode(&self, path: &Path) -> Result<Decoded, DecodeError> {
    let bytes = std::fs::read(path)?;
    Ok(Decoded::Text(String::from_utf8_lossy(&bytes).into_owned()))
  }
}

/// csv / tsv: row-wise linearization, one line per record with fields joined
/// by ", " so cell values stay adjacent for embedding.
struct DelimitedTextDecoder {
  delimiter: char,
}

impl Decoder for DelimitedTextDecoder {
  fn decode(&self, path: &Path) -> Result<Decoded, DecodeError> {
    let bytes = std::fs::read(path)?;
    let raw = String::from_utf8_lossy(&bytes);
    let text = raw
      .lines()
      .map(|line| {
        line
          .split(self.delimiter)
          .map(|field| field.trim().trim_matches('"'))
          .collect::<Vec<_>>()
          .join(", ")
      })
      .collect::<Vec<_>>()
      .join("\n");
    Ok(Decoded::Text(text))
  }
}

/// rtf: control-word stripper. Good enough for plain rich-text documents;
/// embedded objects and images are dropped.
struct RtfDecoder;

impl Decoder for RtfDecoder {
  fn decode(&self, path: &Path) -> Result<Decoded, DecodeError> {
    let bytes = std::fs::read(path)?;
    let raw = String::from_utf8_lossy(&bytes);
    if !raw.trim_start().starts_with("{\\rtf") {
      return Err(DecodeError::Malformed("missing {\\rtf header".to_string()));
    }
    Ok(Decoded::Text(strip_rtf(&raw)))
  }
}

/// Destination groups whose content is metadata, not document text.
const RTF_SKIP_GROUPS: &[&str] = &["fonttbl", "colortbl", "stylesheet", "info", "pict", "themedata"];

fn strip_rtf(raw: &str) -> String {
  let chars: Vec<char> = raw.chars().collect();
  let mut out = String::with_capacity(chars.len() / 2);
  let mut i = 0;

  while i < chars.len() {
    match chars[i] {
      '{' => {
        let (word, starred) = rtf_group_word(&chars, i + 1);
        if starred || RTF_SKIP_GROUPS.contains(&word.as_str()) {
          i = rtf_skip_group(&chars, i);
        } else {
          i += 1;
        }
      }
      '}' => i += 1,
      '\\' => {
        i += 1;
        if i >= chars.len() {
          break;
        }
        match chars[i] {
          '\\' | '{' | '}' => {
            out.push(chars[i]);
            i += 1;
          }
          '\'' => {
            // \'hh — hex-escaped byte
            let hex: String = chars[i + 1..].iter().take(2).collect();
            if let Ok(byte) = u8::from_str_radix(&hex, 16) {
              out.push(byte as char);
            }
            i += 1 + hex.chars().count();
          }
          _ => {
            let mut word = String::new();
            while i < chars.len() && chars[i].is_ascii_alphabetic() {
              word.push(chars[i]);
              i += 1;
            }
            // Optional numeric argument
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '-') {
              i += 1;
            }
            // A single space delimits the control word
            if i < chars.len() && chars[i] == ' ' {
              i += 1;
            }
            match word.as_str() {
              "par" | "line" | "sect" | "page" => out.push('\n'),
              "tab" => out.push('\t'),
              _ => {}
            }
          }
        }
      }
      '\r' | '\n' => i += 1,
      c => {
        out.push(c);
        i += 1;
      }
    }
  }

  out.trim().to_string()
}

/// Control word immediately following a group open, and whether the group is
/// a `{\*` starred destination.
fn rtf_group_word(chars: &[char], mut i: usize) -> (String, bool) {
  if i >= chars.len() || chars[i] != '\\' {
    return (String::new(), false);
  }
  i += 1;
  if i < chars.len() && chars[i] == '*' {
    return (String::new(), true);
  }
  let mut word = String::new();
  while i < chars.len() && chars[i].is_ascii_alphabetic() {
    word.push(chars[i]);
    i += 1;
  }
  (word, false)
}

/// Advance past a balanced group starting at `open` (index of `{`).
fn rtf_skip_group(chars: &[char], open: usize) -> usize {
  let mut depth = 0usize;
  let mut i = open;
  while i < chars.len() {
    match chars[i] {
      '\\' => i += 2, // escaped character, including \{ and \}
      '{' => {
        depth += 1;
        i += 1;
      }
      '}' => {
        depth -= 1;
        i += 1;
        if depth == 0 {
          return i;
        }
      }
      _ => i += 1,
    }
  }
  i
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;

  fn write(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
  }

  #[test]
  fn builtin_registry_versions() {
    let registry = ParserRegistry::builtin();
    assert_eq!(registry.version("txt"), Some(4));
    assert_eq!(registry.version("md"), Some(4));
    assert_eq!(registry.version("csv"), Some(2));
    assert_eq!(registry.version("tsv"), Some(2));
    assert_eq!(registry.version("rtf"), Some(1));
    assert_eq!(registry.version("pdf"), None, "binary formats are external");
  }

  #[test]
  fn lookup_is_case_insensitive() {
    let registry = ParserRegistry::builtin();
    assert!(registry.get("TXT").is_some());
    assert!(registry.get("Md").is_some());
  }

  #[test]
  fn registering_external_decoder_overrides_version() {
    struct Fake;
    impl Decoder for Fake {
      fn decode(&self, _: &Path) -> Result<Decoded, DecodeError> {
        Ok(Decoded::Text("fake".to_string()))
      }
    }
    let mut registry = ParserRegistry::builtin();
    registry.register("pdf", Arc::new(Fake), 3);
    assert_eq!(registry.version("pdf"), Some(3));
  }

  #[test]
  fn plain_text_decodes_verbatim() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "a.txt", "hello world");
    let (decoder, _) = ParserRegistry::builtin().get("txt").unwrap();
    assert_eq!(decoder.decode(&path).unwrap(), Decoded::Text("hello world".to_string()));
  }

  #[test]
  fn csv_rows_are_linearized() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "t.csv", "name,age\n\"Ada\",36\nAlan, 41");
    let (decoder, _) = ParserRegistry::builtin().get("csv").unwrap();
    assert_eq!(
      decoder.decode(&path).unwrap(),
      Decoded::Text("name, age\nAda, 36\nAlan, 41".to_string())
    );
  }

  #[test]
  fn rtf_control_words_are_stripped() {
    let dir = TempDir::new().unwrap();
    let path = write(
      &dir,
      "d.rtf",
      r"{\rtf1\ansi\deff0 {\fonttbl{\f0 Arial;}}Hello \b bold\b0  world.\par Second line.}",
    );
    let (decoder, _) = ParserRegistry::builtin().get("rtf").unwrap();
    let Decoded::Text(text) = decoder.decode(&path).unwrap() else {
      panic!("expected text");
    };
    assert!(text.contains("Hello bold world."), "got: {text}");
    assert!(text.contains("Second line."), "got: {text}");
    assert!(!text.contains('\\'), "control words must be stripped: {text}");
    assert!(!text.contains("Arial"), "font table must not leak: {text}");
  }

  #[test]
  fn rtf_without_header_is_malformed() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "bad.rtf", "just plain text");
    let (decoder, _) = ParserRegistry::builtin().get("rtf").unwrap();
    assert!(matches!(decoder.decode(&path), Err(DecodeError::Malformed(_))));
  }

  #[test]
  fn rtf_hex_escapes_decode() {
    assert_eq!(strip_rtf(r"{\rtf1 caf\'e9}"), "caf\u{e9}");
  }

  #[test]
  fn empty_document_has_zero_chars() {
    assert_eq!(Decoded::Text("   \n  ".to_string()).char_count(), 0);
    assert_eq!(
      Decoded::Pages(vec![Page {
        number: 1,
        text: "  ".to_string()
      }])
      .char_count(),
      0
    );
  }
}
