//! Line-boundary token splitter.
//!
//! Splits a document's text into [`Chunk`]s whose estimated token count never
//! exceeds `max_tokens`. Chunks are contiguous, non-overlapping slices of the
//! original text, so concatenating them in order reproduces the document
//! (minus whitespace-only stretches, which are never emitted as chunks).
//!
//! # Algorithm
//!
//! 1. Convert `max_tokens` to `max_chars` using a 4 chars/token ratio.
//! 2. Walk the text line by line (newlines stay attached to their line).
//! 3. Accumulate lines into the current segment until the next line would
//!    push it past `max_chars`, then flush.
//! 4. A single line longer than `max_chars` is split on its own at the last
//!    whitespace before the limit, or hard-split at a char boundary when the
//!    line has no whitespace.
//! 5. Empty or whitespace-only documents yield zero chunks.
//!
//! The output depends only on the text and `max_tokens`, so re-splitting
//! unchanged content always reproduces the same boundaries.
//!
//! # Example
//!
//! ```rust
//! use live_context_core::chunk::split_text;
//!
//! let segments = split_text("def f():\n    return 1\n", 400);
//! assert_eq!(segments.len(), 1);
//! assert_eq!(segments[0].lines.start, 1);
//! assert_eq!(segments[0].lines.end, 2);
//! ```

use crate::models::{Chunk, Document, LineRange};

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Default maximum chunk size in tokens.
pub const DEFAULT_MAX_TOKENS: usize = 400;

/// Estimate the token count of `text` (`ceil(chars / 4)`).
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// A borrowed slice of the source text with its line span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<'a> {
    pub text: &'a str,
    pub lines: LineRange,
}

/// Split `text` into segments of at most `max_tokens` estimated tokens.
pub fn split_text(text: &str, max_tokens: usize) -> Vec<Segment<'_>> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let mut segments = Vec::new();

    if text.trim().is_empty() {
        return segments;
    }

    let mut builder = SegmentBuilder::new(text);
    let mut offset = 0usize;

    for (line_no, line) in (1u32..).zip(text.split_inclusive('\n')) {
        let line_chars = line.chars().count();

        if line_chars > max_chars {
            builder.flush(&mut segments);
            for piece in split_long_line(line, max_chars) {
                let start = offset + piece.0;
                builder.start(start, line_no);
                builder.extend(start + piece.1.len(), piece.1.chars().count(), line_no);
                builder.flush(&mut segments);
            }
        } else {
            if builder.chars + line_chars > max_chars {
                builder.flush(&mut segments);
            }
            if builder.is_empty() {
                builder.start(offset, line_no);
            }
            builder.extend(offset + line.len(), line_chars, line_no);
        }

        offset += line.len();
    }
    builder.flush(&mut segments);

    segments
}

/// Split a document into ordered chunks tagged with its identity and version.
pub fn split_document(doc: &Document, max_tokens: usize) -> Vec<Chunk> {
    let document_id = doc.id();
    split_text(&doc.content, max_tokens)
        .into_iter()
        .zip(0u32..)
        .map(|(segment, chunk_index)| Chunk {
            document_id: document_id.clone(),
            chunk_index,
            text: segment.text.to_string(),
            token_count: estimate_tokens(segment.text),
            version: doc.version,
            lines: segment.lines,
        })
        .collect()
}

/// Accumulates consecutive lines into one segment.
struct SegmentBuilder<'a> {
    text: &'a str,
    start: usize,
    end: usize,
    chars: usize,
    first_line: u32,
    last_line: u32,
}

impl<'a> SegmentBuilder<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            start: 0,
            end: 0,
            chars: 0,
            first_line: 0,
            last_line: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.end == self.start
    }

    fn start(&mut self, at: usize, line: u32) {
        self.start = at;
        self.end = at;
        self.chars = 0;
        self.first_line = line;
        self.last_line = line;
    }

    fn extend(&mut self, end: usize, chars: usize, line: u32) {
        self.end = end;
        self.chars += chars;
        self.last_line = line;
    }

    fn flush(&mut self, out: &mut Vec<Segment<'a>>) {
        if !self.is_empty() {
            let slice = &self.text[self.start..self.end];
            // Whitespace-only stretches carry nothing worth retrieving.
            if !slice.trim().is_empty() {
                out.push(Segment {
                    text: slice,
                    lines: LineRange {
                        start: self.first_line,
                        end: self.last_line,
                    },
                });
            }
        }
        self.start = self.end;
        self.chars = 0;
    }
}

/// Split one oversized line into `(byte_offset, piece)` pairs of at most
/// `max_chars` chars each.
fn split_long_line(line: &str, max_chars: usize) -> Vec<(usize, &str)> {
    let mut pieces = Vec::new();
    let mut consumed = 0usize;
    let mut remaining = line;

    while !remaining.is_empty() {
        let limit = match remaining.char_indices().nth(max_chars) {
            Some((byte_idx, _)) => byte_idx,
            None => remaining.len(),
        };

        let cut = if limit < remaining.len() {
            remaining[..limit]
                .char_indices()
                .rev()
                .find(|(idx, c)| *idx > 0 && c.is_whitespace())
                .map(|(idx, c)| idx + c.len_utf8())
                .unwrap_or(limit)
        } else {
            limit
        };

        pieces.push((consumed, &remaining[..cut]));
        consumed += cut;
        remaining = &remaining[cut..];
    }

    pieces
}
