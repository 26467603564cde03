//! Recursive-separator text chunker with overlap.
//!
//! Splits extracted document text into [`Chunk`]s of at most `chunk_size`
//! characters. Consecutive chunks share up to `overlap` characters so that
//! a sentence cut at a boundary still appears whole in one of them.
//!
//! # Algorithm
//!
//! 1. Split the text on the first separator in [`SEPARATORS`] that occurs
//!    in it. Each separator stays attached to the text before it, so the
//!    segments tile the input exactly.
//! 2. Any segment still longer than `chunk_size` is split again with the
//!    next separator. The last separator (`""`) splits into single
//!    characters.
//! 3. Merge segments greedily into a window of at most `chunk_size`
//!    characters. When the next segment does not fit, emit the window,
//!    then drop leading segments until at most `overlap` characters remain
//!    and the next segment fits.
//! 4. Trim each emitted window; drop it if only whitespace remains.
//!
//! All lengths and offsets are in characters, not bytes.
//!
//! # Example
//!
//! ```rust
//! use docent_core::chunk::split_text;
//!
//! let spans = split_text("Hello world.\n\nSecond paragraph.", 1000, 200).unwrap();
//! assert_eq!(spans.len(), 1);
//! assert_eq!(spans[0].start_char, 0);
//! ```

use std::collections::VecDeque;

use anyhow::Result;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::fingerprint::sha256_hex;
use crate::models::Chunk;

/// Separator hierarchy, coarsest first.
pub const SEPARATORS: [&str; 5] = ["\n\n", "\n", ". ", " ", ""];

/// A trimmed slice of the input with its character offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSpan {
    pub text: String,
    pub start_char: usize,
    pub end_char: usize,
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    start: usize,
    end: usize,
    chars: usize,
}

/// Split `text` into overlapping spans.
///
/// Returns an empty vector for empty or whitespace-only input. Fails with
/// [`PipelineError::Validation`] if `chunk_size` is zero or `overlap` is not
/// smaller than `chunk_size`.
///
/// # Guarantees
///
/// - Deterministic for identical `(text, chunk_size, overlap)`.
/// - No span is longer than `chunk_size` characters.
/// - Spans are ordered by `start_char`, which never decreases.
pub fn split_text(text: &str, chunk_size: usize, overlap: usize) -> Result<Vec<TextSpan>> {
    if chunk_size == 0 {
        return Err(PipelineError::Validation("chunk_size must be greater than 0".into()).into());
    }
    if overlap >= chunk_size {
        return Err(PipelineError::Validation(format!(
            "overlap ({}) must be smaller than chunk_size ({})",
            overlap, chunk_size
        ))
        .into());
    }
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut segments = Vec::new();
    split_recursive(text, 0, text.len(), &SEPARATORS, chunk_size, &mut segments);

    let mut spans = Vec::new();
    let mut offsets = CharCursor::default();
    let mut window: VecDeque<Segment> = VecDeque::new();
    let mut total = 0usize;

    for seg in segments {
        if total + seg.chars > chunk_size && !window.is_empty() {
            emit(text, &window, &mut offsets, &mut spans);
            while let Some(front) = window.front() {
                if total > overlap || total + seg.chars > chunk_size {
                    total -= front.chars;
                    window.pop_front();
                } else {
                    break;
                }
            }
        }
        total += seg.chars;
        window.push_back(seg);
    }
    if !window.is_empty() {
        emit(text, &window, &mut offsets, &mut spans);
    }

    Ok(spans)
}

/// Chunk a document and assign ordinals, hashes, and deterministic ids.
///
/// Ordinals are contiguous from 0. Identical `(source_path, text)` always
/// yields identical chunks, ids included.
pub fn chunk_document(
    source_path: &str,
    text: &str,
    chunk_size: usize,
    overlap: usize,
) -> Result<Vec<Chunk>> {
    let spans = split_text(text, chunk_size, overlap)?;
    Ok(spans
        .into_iter()
        .enumerate()
        .map(|(i, span)| make_chunk(source_path, i as i64, span))
        .collect())
}

/// Deterministic chunk id: UUID v5 over path, ordinal, and text hash.
pub fn chunk_id(source_path: &str, ordinal: i64, hash: &str) -> String {
    let name = format!("{}\u{0}{}\u{0}{}", source_path, ordinal, hash);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

fn make_chunk(source_path: &str, ordinal: i64, span: TextSpan) -> Chunk {
    let hash = sha256_hex(span.text.as_bytes());
    Chunk {
        id: chunk_id(source_path, ordinal, &hash),
        source_path: source_path.to_string(),
        ordinal,
        text: span.text,
        start_char: span.start_char as i64,
        end_char: span.end_char as i64,
        hash,
    }
}

fn split_recursive(
    text: &str,
    start: usize,
    end: usize,
    separators: &[&str],
    chunk_size: usize,
    out: &mut Vec<Segment>,
) {
    let piece = &text[start..end];
    let chars = piece.chars().count();
    if chars <= chunk_size {
        if chars > 0 {
            out.push(Segment { start, end, chars });
        }
        return;
    }

    // First separator present in this piece; "" always matches.
    let Some(pos) = separators
        .iter()
        .position(|sep| sep.is_empty() || piece.contains(sep))
    else {
        return;
    };
    let sep = separators[pos];
    let rest = &separators[pos + 1..];

    if sep.is_empty() {
        for (i, c) in piece.char_indices() {
            out.push(Segment {
                start: start + i,
                end: start + i + c.len_utf8(),
                chars: 1,
            });
        }
        return;
    }

    let mut cursor = 0;
    for (i, m) in piece.match_indices(sep) {
        let piece_end = i + m.len();
        if piece_end > cursor {
            split_recursive(text, start + cursor, start + piece_end, rest, chunk_size, out);
        }
        cursor = piece_end;
    }
    if cursor < piece.len() {
        split_recursive(text, start + cursor, end, rest, chunk_size, out);
    }
}

fn emit(text: &str, window: &VecDeque<Segment>, offsets: &mut CharCursor, out: &mut Vec<TextSpan>) {
    let (Some(first), Some(last)) = (window.front(), window.back()) else {
        return;
    };
    let raw = &text[first.start..last.end];
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return;
    }
    let lead = raw.len() - raw.trim_start().len();
    let start_char = offsets.char_index(text, first.start + lead);
    out.push(TextSpan {
        text: trimmed.to_string(),
        start_char,
        end_char: start_char + trimmed.chars().count(),
    });
}

/// Byte-to-char offset conversion that walks forward from the last query.
#[derive(Default)]
struct CharCursor {
    byte: usize,
    chars: usize,
}

impl CharCursor {
    fn char_index(&mut self, text: &str, byte: usize) -> usize {
        if byte < self.byte {
            self.byte = 0;
            self.chars = 0;
        }
        self.chars += text[self.byte..byte].chars().count();
        self.byte = byte;
        self.chars
    }
}
