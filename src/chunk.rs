//! Fixed-length sliding-window text chunker.
//!
//! Splits extracted document text into windows measured in Unicode scalar
//! values, so a multi-byte character is never cut in half.
//!
//! Two windowing modes are available:
//!
//! | Mode | Window length | Step | Notes |
//! |------|---------------|------|-------|
//! | [`ChunkMode::Sliding`] | `chunk_size` | `chunk_size - chunk_overlap` | Adjacent chunks share `chunk_overlap` characters; the last window ends at the end of the text. |
//! | [`ChunkMode::Literal`] | `chunk_overlap` | none | Legacy behavior: the overlap parameter is used as both window length and step-back, so only the first window is ever emitted. |
//!
//! Both modes return nothing for blank text and `[text]` when the text is no
//! longer than `chunk_overlap`.
//!
//! [`TextSplitter`] applies the chunker to whole [`Document`]s: each child
//! inherits the parent's metadata and gains its position and a SHA-256 hash.

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::models::Document;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkMode {
    #[default]
    Sliding,
    Literal,
}

/// Split `text` into chunks. Never fails: invalid sizes degrade to a
/// one-character step instead of looping forever.
pub fn split_text(text: &str, chunk_size: usize, chunk_overlap: usize, mode: ChunkMode) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= chunk_overlap {
        return vec![text.to_string()];
    }

    match mode {
        ChunkMode::Sliding => split_sliding(&chars, chunk_size, chunk_overlap),
        ChunkMode::Literal => split_literal(&chars, chunk_overlap),
    }
}

fn split_sliding(chars: &[char], chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    let window = chunk_size.max(1);
    let step = window.saturating_sub(chunk_overlap).max(1);
    let len = chars.len();

    let mut chunks = Vec::new();
    let mut pos = 0;
    loop {
        let end = (pos + window).min(len);
        chunks.push(chars[pos..end].iter().collect());
        if end == len {
            break;
        }
        pos += step;
    }
    chunks
}

fn split_literal(chars: &[char], chunk_overlap: usize) -> Vec<String> {
    let len = chars.len();
    let mut chunks = Vec::new();
    let mut pos = 0;
    loop {
        let end = (pos + chunk_overlap).min(len);
        chunks.push(chars[pos..end].iter().collect());
        let next = end.saturating_sub(chunk_overlap);
        if next <= pos {
            break;
        }
        pos = next;
    }
    chunks
}

/// SHA-256 of `text`, hex-encoded.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Splits documents into chunk documents.
#[derive(Debug, Clone)]
pub struct TextSplitter {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub mode: ChunkMode,
}

impl TextSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize, mode: ChunkMode) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
            mode,
        }
    }

    /// Split every document, preserving input order.
    pub fn apply(&self, documents: &[Document]) -> Vec<Document> {
        documents
            .iter()
            .flat_map(|doc| self.split_document(doc))
            .collect()
    }

    fn split_document(&self, doc: &Document) -> Vec<Document> {
        let pieces = split_text(&doc.text, self.chunk_size, self.chunk_overlap, self.mode);
        let total = pieces.len();
        pieces
            .into_iter()
            .enumerate()
            .map(|(index, piece)| {
                let hash = content_hash(&piece);
                let mut chunk = Document::new(piece);
                chunk.metadata = doc.metadata.clone();
                chunk
                    .with_metadata("parent_document_id", doc.id.as_str())
                    .with_metadata("chunk_index", index)
                    .with_metadata("total_chunks", total)
                    .with_metadata("content_hash", hash)
            })
            .collect()
    }
}
