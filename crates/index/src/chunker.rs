//! Sentence-aware text chunker.
//!
//! Targets ~500 tokens (~2000 characters at 4 chars/token) per chunk with
//! ~60 tokens (~240 characters) of overlap. Chunks break at sentence
//! terminators where possible, otherwise on whitespace, otherwise at the
//! hard boundary. Offsets are character offsets into the extracted text.

use semadex_core::CHARS_PER_TOKEN;

use crate::parsers::Decoded;

/// Configuration for the chunker
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
  /// Target characters per chunk
  pub target_chars: usize,
  /// Overlap carried into the next chunk
  pub overlap_chars: usize,
}

impl Default for ChunkerConfig {
  fn default() -> Self {
    Self {
      target_chars: 500 * CHARS_PER_TOKEN,
      overlap_chars: 60 * CHARS_PER_TOKEN,
    }
  }
}

/// One chunk of extracted text, before embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
  /// 0-based ordinal within the source document.
  pub index: u32,
  /// Character offset of the first character in the extracted text.
  pub offset: u32,
  /// 1-based page number, 0 when the decoder produced a single blob.
  pub page: u32,
  pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct Chunker {
  config: ChunkerConfig,
}

impl Chunker {
  pub fn new(config: ChunkerConfig) -> Self {
    Self { config }
  }

  /// Chunk decoder output. Pages are chunked per page with a running
  /// character offset and a continuous chunk index across the document.
  pub fn chunk_decoded(&self, decoded: &Decoded) -> Vec<TextChunk> {
    match decoded {
      Decoded::Text(text) => self.chunk_with(text, 0, 0, &mut 0),
      Decoded::Pages(pages) => {
        let mut chunks = Vec::new();
        let mut offset = 0u32;
        let mut index = 0u32;
        for page in pages {
          chunks.extend(self.chunk_with(&page.text, page.number, offset, &mut index));
          offset += page.text.chars().count() as u32;
        }
        chunks
      }
    }
  }

  /// Chunk a single text blob (page 0).
  pub fn chunk_text(&self, text: &str) -> Vec<TextChunk> {
    self.chunk_with(text, 0, 0, &mut 0)
  }

  fn chunk_with(&self, text: &str, page: u32, base_offset: u32, next_index: &mut u32) -> Vec<TextChunk> {
    let chars: Vec<char> = text.chars().collect();
    let target = self.config.target_chars.max(1);
    let overlap = self.config.overlap_chars.min(target / 2);

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
      let remaining = chars.len() - start;
      let end = if remaining <= target {
        // Final piece, including a chunk exactly at target size: no overlap tail.
        chars.len()
      } else {
        find_break(&chars, start, start + target)
      };

      let piece: String = chars[start..end].iter().collect();
      if !piece.trim().is_empty() {
        chunks.push(TextChunk {
          index: *next_index,
          offset: base_offset + start as u32,
          page,
          text: piece,
        });
        *next_index += 1;
      }

      if end >= chars.len() {
        break;
      }
      // Overlap: the next chunk re-reads the tail of this one.
      start = end.saturating_sub(overlap).max(start + 1);
    }

    chunks
  }
}

/// Best break position in `(start, hard_end]`: prefer the last sentence
/// terminator in the back half of the window, then the last whitespace,
/// otherwise the hard boundary.
fn find_break(chars: &[char], start: usize, hard_end: usize) -> usize {
  let window_start = start + (hard_end - start) / 2;

  let mut i = hard_end;
  while i > window_start {
    let c = chars[i - 1];
    if matches!(c, '.' | '!' | '?') && (i == chars.len() || chars[i].is_whitespace()) {
      return i;
    }
    i -= 1;
  }

  let mut i = hard_end;
  while i > window_start {
    if chars[i - 1].is_whitespace() {
      return i;
    }
    i -= 1;
  }

  hard_end
}
