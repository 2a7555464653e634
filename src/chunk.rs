//! Line-based overlapping chunker.
//!
//! Splits document text into [`Chunk`]s that respect a configurable token
//! budget, accumulating whole source lines so every chunk maps back to an
//! exact 1-indexed line range for attribution.
//!
//! Token counts use a fixed `ceil(utf8_len / 4)` heuristic, not a real
//! tokenizer. The same heuristic is shared with context assembly so the
//! two stages agree on cost.
//!
//! # Algorithm
//!
//! 1. Iterate source lines, accumulating them into a running buffer.
//! 2. When adding the next line would push the buffer past
//!    `chunk_size_tokens` and the buffer is non-empty, close the current
//!    chunk and record its line range.
//! 3. Seed the next buffer with the trailing `overlap_tokens`-worth of
//!    lines from the closed chunk (`floor(overlap_tokens / average tokens
//!    per line)`, clamped so every chunk advances).
//! 4. Emit the final partial buffer, if non-empty, as the last chunk.
//!
//! A single line longer than `chunk_size_tokens` is emitted as its own
//! oversized chunk; lines are never split. Empty input produces zero
//! chunks.

use chrono::Utc;

use crate::models::Chunk;

/// Approximate bytes-per-token ratio.
///
/// This is a rough heuristic (4 bytes ≈ 1 token), documented as an
/// approximation rather than a tokenizer.
const BYTES_PER_TOKEN: usize = 4;

/// Default chunk budget, in estimated tokens.
pub const DEFAULT_CHUNK_SIZE_TOKENS: usize = 500;

/// Default overlap carried between consecutive chunks, in estimated tokens.
pub const DEFAULT_OVERLAP_TOKENS: usize = 50;

/// Estimate the token cost of a piece of text: `ceil(utf8_len / 4)`.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(BYTES_PER_TOKEN)
}

/// Split text into line-aligned chunks with overlap.
///
/// Returns chunks in source order. Each chunk's `start_line`/`end_line`
/// are 1-indexed and inclusive, and its id is derived from
/// `(document_path, start_line, end_line)`.
pub fn chunk_lines(
    document_path: &str,
    text: &str,
    chunk_size_tokens: usize,
    overlap_tokens: usize,
) -> Vec<Chunk> {
    let now = Utc::now().timestamp();
    if text.is_empty() {
        return Vec::new();
    }

    let lines: Vec<&str> = text.lines().collect();
    let mut chunks = Vec::new();

    // `start` is the 0-based index of the first buffered line.
    let mut start = 0usize;
    let mut buf_tokens = 0usize;

    for (i, line) in lines.iter().enumerate() {
        let line_tokens = estimate_tokens(line);

        if i > start && buf_tokens + line_tokens > chunk_size_tokens {
            chunks.push(make_chunk(document_path, &lines, start, i - 1, now));

            // Seed the next buffer with trailing overlap lines, clamped so
            // the next chunk always ends at least one line further.
            let closed_lines = i - start;
            let avg_tokens = (buf_tokens as f64 / closed_lines as f64).max(1.0);
            let overlap_lines =
                ((overlap_tokens as f64 / avg_tokens).floor() as usize).min(closed_lines - 1);
            start = i - overlap_lines;
            buf_tokens = lines[start..i].iter().map(|l| estimate_tokens(l)).sum();
        }

        buf_tokens += line_tokens;
    }

    if start < lines.len() {
        let tail = make_chunk(document_path, &lines, start, lines.len() - 1, now);
        // A buffer of nothing but blank lines is not worth a chunk.
        if !tail.text.trim().is_empty() {
            chunks.push(tail);
        }
    }

    chunks
}

fn make_chunk(document_path: &str, lines: &[&str], start: usize, end: usize, now: i64) -> Chunk {
    let start_line = (start + 1) as u32;
    let end_line = (end + 1) as u32;
    Chunk {
        id: Chunk::make_id(document_path, start_line, end_line),
        text: lines[start..=end].join("\n"),
        start_line,
        end_line,
        document_path: document_path.to_string(),
        created_at: now,
    }
}
