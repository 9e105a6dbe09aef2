//! Document normalization and chunking for the embedding index.

use scraper::{Html, Node};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::config::{ChunkingConfig, ChunkingPolicy};
use crate::document::{Document, DocumentBatch, MalformedEntry};

/// Retrievable unit of text derived from a [`Document`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// `{source_id}::chunk_{chunk_index}`.
    pub id: String,
    /// Owning document id.
    pub source_id: String,
    /// Position of the chunk within its document (offset by any crawler index).
    pub chunk_index: usize,
    /// Normalized chunk text.
    pub content: String,
    /// Length of `content` in characters.
    pub content_length: usize,
    /// Document title.
    pub title: String,
    /// Document URL.
    pub url: String,
    /// Document source type.
    pub source_type: String,
    /// Milliseconds since epoch when the chunk was produced.
    pub processed_at: u64,
}

impl Chunk {
    /// Composite chunk identity.
    pub fn make_id(source_id: &str, chunk_index: usize) -> String {
        format!("{source_id}::chunk_{chunk_index}")
    }
}

/// Outcome of chunking one batch.
#[derive(Debug, Clone, Default)]
pub struct ChunkReport {
    /// Emitted chunks in document order.
    pub chunks: Vec<Chunk>,
    /// Documents that produced at least one chunk.
    pub documents: usize,
    /// Chunks dropped by the prefix dedup.
    pub duplicates: usize,
    /// Chunks dropped for holding no letters or digits.
    pub no_text: usize,
    /// Entries skipped as malformed.
    pub malformed: Vec<MalformedEntry>,
}

impl ChunkReport {
    /// Folds another report into this one.
    pub fn merge(&mut self, other: ChunkReport) {
        self.chunks.extend(other.chunks);
        self.documents += other.documents;
        self.duplicates += other.duplicates;
        self.no_text += other.no_text;
        self.malformed.extend(other.malformed);
    }

    /// Number of malformed entries skipped.
    pub fn skipped(&self) -> usize {
        self.malformed.len()
    }
}

/// Stateless chunking service.
#[derive(Clone, Debug)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    /// Builds a chunker over the given settings.
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    /// Returns the underlying config reference.
    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Normalizes one document and splits it into chunks.
    ///
    /// Pure with respect to ids and content: the same document and config always
    /// yield the same sequence.
    pub fn normalize_and_chunk(&self, document: &Document) -> Vec<Chunk> {
        let text = clean_text(&document.raw_text);
        if text.is_empty() {
            return Vec::new();
        }
        let pieces = match self.config.policy_for(&document.source_type) {
            ChunkingPolicy::Sentence => chunk_sentences(
                &text,
                self.config.chunk_size,
                self.config.min_chunk_size,
            ),
            ChunkingPolicy::SlidingWindow => chunk_window(
                &text,
                self.config.chunk_size,
                self.config.effective_overlap(),
            ),
        };
        let processed_at = epoch_ms();
        let base = document.chunk_index.unwrap_or(0);
        pieces
            .into_iter()
            .enumerate()
            .map(|(i, content)| {
                let chunk_index = base + i;
                Chunk {
                    id: Chunk::make_id(&document.source_id, chunk_index),
                    source_id: document.source_id.clone(),
                    chunk_index,
                    content_length: content.chars().count(),
                    content,
                    title: document.title.clone(),
                    url: document.url.clone(),
                    source_type: document.source_type.clone(),
                    processed_at,
                }
            })
            .collect()
    }

    /// Chunks every document of a batch, dropping chunks whose leading
    /// characters repeat an earlier chunk of the same batch and chunks with
    /// nothing an embedder could index (symbols or punctuation only).
    pub fn chunk_batch(&self, batch: &DocumentBatch) -> ChunkReport {
        let mut report = ChunkReport {
            malformed: batch.malformed.clone(),
            ..ChunkReport::default()
        };
        let mut seen: HashSet<String> = HashSet::new();
        for document in &batch.documents {
            let mut emitted = 0usize;
            for chunk in self.normalize_and_chunk(document) {
                if !has_text(&chunk.content) {
                    debug!(chunk = %chunk.id, "dropping chunk without letters or digits");
                    report.no_text += 1;
                    continue;
                }
                let key = prefix(&chunk.content, self.config.dedup_prefix);
                if !seen.insert(key) {
                    report.duplicates += 1;
                    continue;
                }
                report.chunks.push(chunk);
                emitted += 1;
            }
            if emitted > 0 {
                report.documents += 1;
            }
        }
        if report.chunks.is_empty() {
            warn!(batch = %batch.name, "batch produced zero chunks");
        } else {
            debug!(
                batch = %batch.name,
                chunks = report.chunks.len(),
                duplicates = report.duplicates,
                no_text = report.no_text,
                skipped = report.skipped(),
                "chunked batch"
            );
        }
        report
    }

    /// Chunks several batches, one report per batch in input order; dedup
    /// stays scoped to each batch.
    pub fn chunk_batches(&self, batches: &[DocumentBatch]) -> Vec<ChunkReport> {
        let reports: Vec<ChunkReport> = batches.iter().map(|batch| self.chunk_batch(batch)).collect();
        info!(
            batches = reports.len(),
            chunks = reports.iter().map(|r| r.chunks.len()).sum::<usize>(),
            duplicates = reports.iter().map(|r| r.duplicates).sum::<usize>(),
            skipped = reports.iter().map(ChunkReport::skipped).sum::<usize>(),
            "chunking complete"
        );
        reports
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_millis() as u64)
        .unwrap_or(0)
}

fn has_text(content: &str) -> bool {
    content.chars().any(char::is_alphanumeric)
}

fn prefix(text: &str, chars: usize) -> String {
    text.chars().take(chars).collect()
}

/// Strips markup when the input looks like HTML, then collapses whitespace.
pub fn clean_text(raw: &str) -> String {
    if raw.trim().is_empty() {
        return String::new();
    }
    if looks_like_html(raw) {
        collapse_whitespace(&strip_markup(raw))
    } else {
        collapse_whitespace(raw)
    }
}

fn looks_like_html(raw: &str) -> bool {
    raw.contains('<')
        && raw.contains('>')
        && (raw.trim_start().starts_with('<') || raw.contains("<p") || raw.contains("<div"))
}

fn strip_markup(raw: &str) -> String {
    let document = Html::parse_document(raw);
    let mut out = String::with_capacity(raw.len() / 2);
    for node in document.tree.root().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor.value().as_element().is_some_and(|el| {
                matches!(el.name(), "script" | "style" | "noscript" | "template")
            })
        });
        if hidden {
            continue;
        }
        out.push(' ');
        out.push_str(text);
    }
    out
}

/// Collapses every whitespace run to one space and trims both ends.
pub fn collapse_whitespace(input: &str) -> String {
    let mut buf = String::with_capacity(input.len());
    let mut last_space = false;
    for ch in input.chars() {
        if ch.is_whitespace() {
            if !last_space && !buf.is_empty() {
                buf.push(' ');
            }
            last_space = true;
        } else {
            buf.push(ch);
            last_space = false;
        }
    }
    buf.trim().to_string()
}

/// Splits after `.`, `?` or `!` when followed by whitespace.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0usize;
    let mut chars = text.char_indices().peekable();
    while let Some((idx, ch)) = chars.next() {
        if !matches!(ch, '.' | '?' | '!') {
            continue;
        }
        let Some(&(next_idx, next)) = chars.peek() else {
            break;
        };
        if !next.is_whitespace() {
            continue;
        }
        let end = idx + ch.len_utf8();
        let sentence = text[start..end].trim();
        if !sentence.is_empty() {
            sentences.push(sentence);
        }
        start = next_idx;
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn chunk_sentences(text: &str, size: usize, min_size: usize) -> Vec<String> {
    let size = size.max(1);
    if char_len(text) <= size {
        return vec![text.to_string()];
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;
    for sentence in split_sentences(text) {
        let sentence_len = char_len(sentence);
        if sentence_len > size {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            chunks.extend(hard_split(sentence, size));
            continue;
        }
        let joined_len = if current.is_empty() {
            sentence_len
        } else {
            current_len + 1 + sentence_len
        };
        if joined_len <= size {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(sentence);
            current_len = joined_len;
        } else {
            chunks.push(std::mem::replace(&mut current, sentence.to_string()));
            current_len = sentence_len;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    merge_short_tail(&mut chunks, size, min_size);
    chunks
}

fn hard_split(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size)
        .map(|piece| piece.iter().collect::<String>().trim().to_string())
        .filter(|piece| !piece.is_empty())
        .collect()
}

/// Folds a dangling short tail into its predecessor. When the combined text
/// would exceed `size`, the pair is re-split so both halves fit and the tail
/// reaches `min_size`.
fn merge_short_tail(chunks: &mut Vec<String>, size: usize, min_size: usize) {
    if chunks.len() < 2 {
        return;
    }
    let min_size = min_size.min(size);
    let tail_len = chunks.last().map(|c| char_len(c)).unwrap_or(0);
    if tail_len >= min_size {
        return;
    }
    let Some(tail) = chunks.pop() else {
        return;
    };
    let Some(previous) = chunks.pop() else {
        chunks.push(tail);
        return;
    };
    let combined = format!("{previous} {tail}");
    let combined_chars: Vec<char> = combined.chars().collect();
    if combined_chars.len() <= size {
        chunks.push(combined);
        return;
    }

    // Split at whitespace p: head = [..p], tail = [p+1..], both within bounds.
    // Without whitespace the tail is cut to exactly min_size chars.
    let total = combined_chars.len();
    let lowest = total.saturating_sub(size + 1);
    let highest = total.saturating_sub(min_size + 1);
    let split = (lowest..=highest)
        .rev()
        .find(|&p| combined_chars[p].is_whitespace())
        .unwrap_or(total - min_size);
    let head: String = combined_chars[..split].iter().collect();
    let rest: String = combined_chars[split..].iter().collect();
    chunks.push(head.trim().to_string());
    chunks.push(rest.trim().to_string());
}

fn chunk_window(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let size = size.max(1);
    let step = size.saturating_sub(overlap).max(1);
    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < chars.len() {
        let end = (start + size).min(chars.len());
        let window: String = chars[start..end].iter().collect();
        let window = window.trim();
        if !window.is_empty() {
            chunks.push(window.to_string());
        }
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}
