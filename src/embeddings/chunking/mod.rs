
use std::sync::LazyLock;

use fancy_regex::Regex;
use tracing::{debug, warn};

use crate::rag::{ChunkingStrategy, RagConfig};

/// Content beyond this many bytes is dropped before chunking
pub const MAX_CONTENT_BYTES: usize = 10 * 1024 * 1024;
/// Upper bound on chunks produced by a single call
pub const MAX_CHUNKS: usize = 10_000;
/// Upper bound on characters carried over from the previous chunk
pub const MAX_OVERLAP_CHARS: usize = 1000;
/// A chunk never grows past this size when overlap is prepended
pub const MAX_MERGED_CHUNK_BYTES: usize = 50 * 1024;
/// Smallest chunk size accepted from configuration
pub const MIN_CHUNK_SIZE_FLOOR: usize = 50;

static SENTENCE_BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]\s+").expect("sentence boundary pattern is valid"));

static PARAGRAPH_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n").expect("paragraph break pattern is valid"));

/// Chunk sizes after clamping configuration to usable values.
///
/// All sizes are measured in characters, not bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLimits {
    pub chunk_size: usize,
    pub min_chunk_size: usize,
    pub overlap: usize,
}

impl ChunkLimits {
    #[inline]
    pub fn from_config(config: &RagConfig) -> Self {
        let chunk_size = config.chunk_size.max(MIN_CHUNK_SIZE_FLOOR);
        Self {
            chunk_size,
            min_chunk_size: config.min_chunk_size.clamp(1, chunk_size),
            overlap: config.chunk_overlap.min(chunk_size - 1),
        }
    }

    /// Same sizes with no overlap; the overlap pass adds it after splitting
    fn without_overlap(self) -> Self {
        Self { overlap: 0, ..self }
    }
}

/// Split document text into chunks using the configured strategy.
///
/// Never fails: empty or degenerate input yields fewer (possibly zero)
/// chunks. A non-blank document too short to form a regular chunk yields a
/// single chunk holding its trimmed text.
#[inline]
pub fn chunk_content(text: &str, config: &RagConfig) -> Vec<String> {
    let limits = ChunkLimits::from_config(config);
    let text = truncate_content(text);

    if text.trim().is_empty() {
        return Vec::new();
    }

    let mut chunks = match config.chunking_strategy {
        ChunkingStrategy::Fixed => split_fixed(text, &limits),
        ChunkingStrategy::Sentence | ChunkingStrategy::Semantic => {
            apply_overlap(split_sentences(text, &limits.without_overlap()), limits.overlap)
        }
        ChunkingStrategy::Paragraph => {
            apply_overlap(split_paragraphs(text, &limits.without_overlap()), limits.overlap)
        }
    };

    if chunks.is_empty() {
        let trimmed = text.trim();
        let end = byte_offset(trimmed, limits.chunk_size);
        chunks.push(trimmed[..end].to_string());
    }

    if chunks.len() > MAX_CHUNKS {
        warn!(
            "Chunking produced {} chunks, truncating to {}",
            chunks.len(),
            MAX_CHUNKS
        );
        chunks.truncate(MAX_CHUNKS);
    }

    debug!(
        "Chunked {} chars into {} chunks ({:?}, size {}, overlap {})",
        text.len(),
        chunks.len(),
        config.chunking_strategy,
        limits.chunk_size,
        limits.overlap
    );

    chunks
}

fn truncate_content(text: &str) -> &str {
    if text.len() <= MAX_CONTENT_BYTES {
        return text;
    }

    let mut end = MAX_CONTENT_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }

    warn!(
        "Content of {} bytes exceeds {} bytes, truncating before chunking",
        text.len(),
        MAX_CONTENT_BYTES
    );
    &text[..end]
}

/// Slide a window of `chunk_size` characters across the text
fn split_fixed(text: &str, limits: &ChunkLimits) -> Vec<String> {
    let size = limits.chunk_size;
    let step = match size.saturating_sub(limits.overlap) {
        0 => size,
        step => step,
    };
    let max_iterations = char_len(text).div_ceil(size.max(1)) * 2;

    let mut chunks = Vec::new();
    let mut start = 0;
    let mut iterations = 0;
    let mut reached_end = false;

    while start < text.len() && iterations < max_iterations && chunks.len() < MAX_CHUNKS {
        iterations += 1;

        let rest = &text[start..];
        let end = start + byte_offset(rest, size);
        let window = &text[start..end];

        if !window.trim().is_empty() && char_len(window) >= limits.min_chunk_size {
            chunks.push(window.to_string());
        }

        if end >= text.len() {
            reached_end = true;
            break;
        }
        start += byte_offset(rest, step);
    }

    if !reached_end && start < text.len() {
        warn!(
            "Fixed-size chunking stopped after {} windows, dropping the last {} of {} bytes",
            iterations,
            text.len() - start,
            text.len()
        );
    }

    chunks
}

fn split_sentences(text: &str, limits: &ChunkLimits) -> Vec<String> {
    let sentences = split_units(text, &SENTENCE_BOUNDARY, 1);

    if sentences.len() <= 1 {
        return split_fixed(text.trim(), limits);
    }

    accumulate(&sentences, " ", limits, |sentence| {
        split_fixed(sentence, limits)
    })
}

fn split_paragraphs(text: &str, limits: &ChunkLimits) -> Vec<String> {
    let paragraphs = split_units(text, &PARAGRAPH_BREAK, 0);

    if paragraphs.len() <= 1 {
        return split_sentences(text, limits);
    }

    accumulate(&paragraphs, "\n\n", limits, |paragraph| {
        split_sentences(paragraph, limits)
    })
}

/// Split on every match of `boundary`, keeping the first `keep` bytes of
/// each match with the preceding unit. Units are trimmed; blank ones dropped.
fn split_units<'a>(text: &'a str, boundary: &Regex, keep: usize) -> Vec<&'a str> {
    let mut units = Vec::new();
    let mut last = 0;

    for found in boundary.find_iter(text) {
        let Ok(found) = found else {
            break;
        };
        let unit = text[last..found.start() + keep].trim();
        if !unit.is_empty() {
            units.push(unit);
        }
        last = found.end();
    }

    let unit = text[last..].trim();
    if !unit.is_empty() {
        units.push(unit);
    }

    units
}

/// Greedily pack units into chunks of at most `chunk_size` characters.
/// Units that are too large on their own are handed to `split_oversized`.
fn accumulate<'a, F>(
    units: &[&'a str],
    separator: &str,
    limits: &ChunkLimits,
    split_oversized: F,
) -> Vec<String>
where
    F: Fn(&'a str) -> Vec<String>,
{
    let separator_chars = char_len(separator);
    let mut chunks = Vec::new();
    let mut buffer = String::new();
    let mut buffer_chars = 0;

    for &unit in units {
        if chunks.len() >= MAX_CHUNKS {
            break;
        }

        let unit_chars = char_len(unit);

        if unit_chars > limits.chunk_size {
            flush(&mut chunks, &mut buffer, &mut buffer_chars, limits);
            chunks.extend(split_oversized(unit));
            continue;
        }

        let joined_chars = if buffer.is_empty() {
            unit_chars
        } else {
            buffer_chars + separator_chars + unit_chars
        };

        if joined_chars > limits.chunk_size {
            flush(&mut chunks, &mut buffer, &mut buffer_chars, limits);
        }

        if !buffer.is_empty() {
            buffer.push_str(separator);
            buffer_chars += separator_chars;
        }
        buffer.push_str(unit);
        buffer_chars += unit_chars;
    }

    flush(&mut chunks, &mut buffer, &mut buffer_chars, limits);
    chunks
}

fn flush(
    chunks: &mut Vec<String>,
    buffer: &mut String,
    buffer_chars: &mut usize,
    limits: &ChunkLimits,
) {
    if *buffer_chars >= limits.min_chunk_size {
        chunks.push(std::mem::take(buffer));
    } else {
        buffer.clear();
    }
    *buffer_chars = 0;
}

/// Prefix every chunk with the tail of its predecessor.
///
/// The tail is skipped when it is no longer than half the overlap budget or
/// when the merged chunk would reach [`MAX_MERGED_CHUNK_BYTES`].
fn apply_overlap(chunks: Vec<String>, overlap: usize) -> Vec<String> {
    let budget = overlap.min(MAX_OVERLAP_CHARS);
    if budget == 0 || chunks.len() < 2 {
        return chunks;
    }

    let mut overlapped = Vec::with_capacity(chunks.len());
    overlapped.push(chunks[0].clone());

    for pair in chunks.windows(2) {
        let (previous, current) = (&pair[0], &pair[1]);
        let tail = tail_chars(previous, budget).trim_start();

        if char_len(tail) * 2 > budget && tail.len() + 1 + current.len() < MAX_MERGED_CHUNK_BYTES
        {
            overlapped.push(format!("{} {}", tail, current));
        } else {
            overlapped.push(current.clone());
        }
    }

    overlapped
}

#[inline]
fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Byte offset of the `n`th character, or the full length if shorter
#[inline]
fn byte_offset(text: &str, n: usize) -> usize {
    text.char_indices().nth(n).map_or(text.len(), |(i, _)| i)
}

fn tail_chars(text: &str, n: usize) -> &str {
    let count = char_len(text);
    if count <= n {
        text
    } else {
        &text[byte_offset(text, count - n)..]
    }
}
