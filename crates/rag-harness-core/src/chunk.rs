//! Overlapping window chunker.
//!
//! Splits document text into [`Chunk`]s of roughly `max_chars` bytes, each
//! overlapping its predecessor by up to `overlap_chars` bytes. Every chunk
//! is an exact slice of the source text, so the document can always be
//! rebuilt from its chunks with [`reassemble`].
//!
//! # Algorithm
//!
//! 1. If the rest of the text fits in `max_chars`, emit it as the last chunk.
//! 2. Otherwise look for a split point, preferring (in order) a paragraph
//!    break (`\n\n`), a sentence end (`.`, `!`, `?` followed by whitespace),
//!    then any whitespace. Within each kind, take the last boundary at or
//!    before `max_chars`, else the first one inside the `boundary_slack`
//!    extension. Boundaries in the first half of the window are ignored so
//!    chunks never degenerate into slivers.
//! 3. With no boundary available, hard-cut at `max_chars`.
//! 4. Start the next window `overlap_chars` before the split, nudged
//!    forward to the next word start when that stays inside the overlap.
//!
//! Lengths are measured in UTF-8 bytes and always snapped to char
//! boundaries.
//!
//! # Example
//!
//! ```rust
//! use rag_harness_core::chunk::{chunk_text, reassemble, ChunkParams};
//!
//! let text = "Neo4j is a graph database. It stores data as nodes and relationships.";
//! let chunks = chunk_text("doc-1", text, &ChunkParams::new(40, 10));
//! assert!(chunks.len() >= 2);
//! assert_eq!(reassemble(&chunks), text);
//! ```

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Chunk;

/// Window sizing for [`chunk_text`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    /// Target window length.
    pub max_chars: usize,
    /// Bytes shared with the previous window.
    pub overlap_chars: usize,
    /// How far past `max_chars` a boundary search may reach.
    pub boundary_slack: usize,
}

impl ChunkParams {
    pub fn new(max_chars: usize, overlap_chars: usize) -> Self {
        Self {
            max_chars,
            overlap_chars,
            ..Self::default()
        }
    }

    pub fn with_slack(mut self, boundary_slack: usize) -> Self {
        self.boundary_slack = boundary_slack;
        self
    }
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            max_chars: 300,
            overlap_chars: 50,
            boundary_slack: 20,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Boundary {
    Paragraph,
    Sentence,
    Word,
}

/// Split `text` into overlapping chunks with contiguous indices from 0.
///
/// Returns an empty vector for empty text. Embeddings are left empty for
/// the embedding service to fill in.
pub fn chunk_text(document_id: &str, text: &str, params: &ChunkParams) -> Vec<Chunk> {
    let max_chars = params.max_chars.max(1);
    // Capped so every window advances the cursor.
    let overlap = params.overlap_chars.min(max_chars / 2);

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < text.len() {
        let end = if text.len() - start <= max_chars {
            text.len()
        } else {
            find_split(text, start, max_chars, params.boundary_slack)
        };

        chunks.push(make_chunk(
            document_id,
            chunks.len() as i64,
            start,
            &text[start..end],
        ));

        if end == text.len() {
            break;
        }
        start = next_start(text, start, end, overlap);
    }

    chunks
}

/// Rebuild the source text from its chunks, dropping the overlapping bytes.
///
/// Chunks must be ordered by `chunk_index`.
pub fn reassemble(chunks: &[Chunk]) -> String {
    let mut out = String::new();
    let mut covered = 0usize;

    for chunk in chunks {
        let end = chunk.end();
        if end <= covered {
            continue;
        }
        let skip = covered.saturating_sub(chunk.start);
        out.push_str(&chunk.text[skip..]);
        covered = end;
    }

    out
}

fn find_split(text: &str, start: usize, max_chars: usize, slack: usize) -> usize {
    let target = floor_char_boundary(text, start + max_chars);
    let limit = floor_char_boundary(text, start + max_chars + slack);
    let min_end = start + max_chars / 2;

    for kind in [Boundary::Paragraph, Boundary::Sentence, Boundary::Word] {
        let ends = boundary_ends(text, min_end, limit, kind);
        if let Some(&end) = ends.iter().rev().find(|&&e| e <= target) {
            return end;
        }
        if let Some(&end) = ends.iter().find(|&&e| e > target) {
            return end;
        }
    }

    if target > start {
        target
    } else {
        // A single char wider than the window.
        ceil_char_boundary(text, start + 1)
    }
}

/// Byte offsets just past each boundary of `kind` ending in `(lo, hi]`.
fn boundary_ends(text: &str, lo: usize, hi: usize, kind: Boundary) -> Vec<usize> {
    let scan_from = floor_char_boundary(text, lo);
    let mut prev = text[..scan_from].chars().next_back();
    let mut ends = Vec::new();

    for (offset, c) in text[scan_from..hi].char_indices() {
        let after = scan_from + offset + c.len_utf8();
        let hit = match kind {
            Boundary::Paragraph => c == '\n' && prev == Some('\n'),
            Boundary::Sentence => {
                c.is_whitespace() && matches!(prev, Some('.') | Some('!') | Some('?'))
            }
            Boundary::Word => c.is_whitespace(),
        };
        if hit && after > lo {
            ends.push(after);
        }
        prev = Some(c);
    }

    ends
}

fn next_start(text: &str, start: usize, end: usize, overlap: usize) -> usize {
    let mut next = ceil_char_boundary(text, end.saturating_sub(overlap));
    if next <= start {
        return end;
    }

    let at_word_start = text[..next]
        .chars()
        .next_back()
        .map_or(true, char::is_whitespace);
    if !at_word_start {
        if let Some(pos) = text[next..end].find(char::is_whitespace) {
            let ws = text[next + pos..].chars().next().map_or(1, char::len_utf8);
            next += pos + ws;
        }
    }

    next
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

/// Create a single [`Chunk`] with a UUID and SHA-256 content hash.
fn make_chunk(document_id: &str, index: i64, start: usize, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        start,
        text: text.to_string(),
        hash,
        embedding: Vec::new(),
    }
}
