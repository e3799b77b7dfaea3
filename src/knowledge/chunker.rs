//! Recursive hierarchical text chunker.
//!
//! Text is split on the coarsest separator that occurs in it (paragraphs,
//! then lines, table cells, sentence punctuation, clause punctuation,
//! whitespace, and finally single characters). Pieces that are too large on
//! their own are split again with the next separator, and the resulting
//! pieces are packed greedily, in order, into chunks of at most
//! `chunk_size_tokens`.
//!
//! Each new chunk opens with a tail of the previous one of at most
//! `chunk_overlap_tokens`. The tail is made of whole pieces when they fit;
//! otherwise it is cut from the last piece at a cell, clause or word boundary.
//!
//! Sizes are estimated at [`CHARS_PER_TOKEN`] characters per token.

use std::collections::VecDeque;

use crate::config::IngestConfig;
use crate::store::ChunkingStrategy;

/// Characters per estimated token.
pub const CHARS_PER_TOKEN: usize = 4;

/// Coarse to fine. The empty separator means character slicing.
const SEPARATORS: &[&str] = &[
    "\n\n", "\n", " | ", ". ", "! ", "? ", "; ", ", ", " ", "",
];

/// Boundaries an overlap tail may start on when no whole piece fits.
const TAIL_SEPARATORS: &[&str] = &[" | ", "; ", ", ", " "];

/// Estimated token count of `text` (rounded up).
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

#[derive(Debug, Clone)]
pub struct RecursiveChunker {
    chunk_chars: usize,
    overlap_chars: usize,
    min_chunk_tokens: usize,
}

impl RecursiveChunker {
    pub fn new(
        chunk_size_tokens: usize,
        chunk_overlap_tokens: usize,
        min_chunk_tokens: usize,
    ) -> Self {
        let chunk_size_tokens = chunk_size_tokens.max(1);
        let overlap = chunk_overlap_tokens.min(chunk_size_tokens - 1);
        Self {
            chunk_chars: chunk_size_tokens * CHARS_PER_TOKEN,
            overlap_chars: overlap * CHARS_PER_TOKEN,
            min_chunk_tokens,
        }
    }

    pub fn from_config(config: &IngestConfig) -> Self {
        Self::new(
            config.chunk_size_tokens,
            config.chunk_overlap_tokens,
            config.min_chunk_tokens,
        )
    }

    pub fn strategy(&self) -> ChunkingStrategy {
        ChunkingStrategy::RecursiveV1
    }

    /// Split `text` into ordered chunks. Empty input yields no chunks.
    pub fn split(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let mut pieces = Vec::new();
        self.atomize(text, SEPARATORS, &mut pieces);
        let chunks: Vec<String> = self
            .merge(&pieces)
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();

        let kept: Vec<String> = chunks
            .iter()
            .filter(|c| estimate_tokens(c) >= self.min_chunk_tokens)
            .cloned()
            .collect();

        if kept.is_empty() {
            // A short document is still worth one chunk
            chunks
        } else {
            if kept.len() < chunks.len() {
                tracing::debug!(
                    "Dropped {} chunks below {} tokens",
                    chunks.len() - kept.len(),
                    self.min_chunk_tokens
                );
            }
            kept
        }
    }

    /// Break `text` into pieces that each fit in one chunk. Oversized
    /// pieces are split again with finer separators, in place.
    fn atomize<'a>(&self, text: &'a str, separators: &[&str], out: &mut Vec<&'a str>) {
        if char_len(text) <= self.chunk_chars {
            out.push(text);
            return;
        }

        // First separator present in the text; "" always matches
        let level = separators
            .iter()
            .position(|sep| sep.is_empty() || text.contains(*sep))
            .unwrap_or(separators.len().saturating_sub(1));
        let separator = separators.get(level).copied().unwrap_or("");
        let finer = separators.get(level + 1..).unwrap_or(&[]);

        for piece in split_keeping_separator(text, separator) {
            if char_len(piece) <= self.chunk_chars || finer.is_empty() {
                out.push(piece);
            } else {
                self.atomize(piece, finer, out);
            }
        }
    }

    /// Pack pieces greedily, carrying an overlap tail into each new chunk.
    fn merge(&self, pieces: &[&str]) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut window: VecDeque<(&str, usize)> = VecDeque::new();
        let mut total = 0usize;

        for &piece in pieces {
            let len = char_len(piece);
            if total + len > self.chunk_chars && !window.is_empty() {
                chunks.push(concat(&window));

                // The carried tail must leave room for the incoming piece
                let budget = self.overlap_chars.min(self.chunk_chars.saturating_sub(len));
                let mut last_dropped = None;
                while total > budget {
                    match window.pop_front() {
                        Some((dropped, dropped_len)) => {
                            total -= dropped_len;
                            last_dropped = Some(dropped);
                        }
                        None => break,
                    }
                }

                // No whole piece fits the budget: carry part of the last one
                if let Some(last) = last_dropped.filter(|_| window.is_empty()) {
                    let tail = tail_within(last, budget);
                    if !tail.trim().is_empty() {
                        total = char_len(tail);
                        window.push_back((tail, total));
                    }
                }
            }
            window.push_back((piece, len));
            total += len;
        }

        if !window.is_empty() {
            chunks.push(concat(&window));
        }
        chunks
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn concat(window: &VecDeque<(&str, usize)>) -> String {
    window.iter().map(|(piece, _)| *piece).collect()
}

/// Longest suffix of `piece` of at most `budget` characters that starts on a
/// cell, clause or word boundary. Falls back to a plain character tail.
fn tail_within(piece: &str, budget: usize) -> &str {
    if budget == 0 {
        return "";
    }
    let total = char_len(piece);
    if total <= budget {
        return piece;
    }

    for separator in TAIL_SEPARATORS {
        let mut start = piece.len();
        let mut used = 0;
        for part in split_keeping_separator(piece, separator).iter().rev() {
            let len = char_len(part);
            if used + len > budget {
                break;
            }
            used += len;
            start -= part.len();
        }
        let tail = &piece[start..];
        if !tail.trim().is_empty() {
            return tail;
        }
    }

    match piece.char_indices().nth(total - budget) {
        Some((idx, _)) => &piece[idx..],
        None => "",
    }
}

/// Split after each occurrence of `separator`, keeping it on the left piece.
/// The empty separator splits into single characters.
fn split_keeping_separator<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    if separator.is_empty() {
        return text
            .char_indices()
            .map(|(i, c)| &text[i..i + c.len_utf8()])
            .collect();
    }
    let mut pieces = Vec::new();
    let mut start = 0;
    for (idx, matched) in text.match_indices(separator) {
        let end = idx + matched.len();
        pieces.push(&text[start..end]);
        start = end;
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}
