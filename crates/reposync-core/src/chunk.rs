//! Deterministic chunk identity and the sliding-window text chunker.
//!
//! Chunk identifiers are a pure function of `(repository, path, ordinal)`.
//! Re-chunking an unchanged file therefore yields the same identifiers,
//! and the identifiers of chunks a previous run wrote can be recomputed
//! from the checkpoint's chunk count alone. This is a naming convention,
//! not a content hash: two different texts at the same position share an
//! identifier, which is exactly what an upsert needs.
//!
//! # Algorithm
//!
//! 1. Clean the content: trim every line, drop blank lines, strip control
//!    characters other than tab and newline.
//! 2. Empty result ⇒ no chunks.
//! 3. Content of at most `max_chunk_size` characters ⇒ one chunk.
//! 4. Otherwise slide a `max_chunk_size` window. When the window does not
//!    reach the end, cut after the last sentence terminator or newline if
//!    it lies past the window midpoint.
//! 5. The next window starts `chunk_overlap` characters before the cut.
//!
//! # Example
//!
//! ```rust
//! use reposync_core::chunk::{chunk_id, chunk_ids_for};
//!
//! let ids = chunk_ids_for("org/docs", "README.md", 0..3);
//! assert_eq!(ids.len(), 3);
//! assert_eq!(ids[1], chunk_id("org/docs", "README.md", 1));
//! ```

use std::ops::Range;

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::models::{ChangeRecord, Chunk, ChunkMetadata};
use crate::traits::Chunker;

/// Sizing parameters passed to a [`Chunker`] with every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    /// Maximum characters per chunk.
    pub max_chunk_size: usize,
    /// Characters shared between consecutive chunks.
    pub chunk_overlap: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            max_chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

/// Stable identifier of the chunk at `ordinal` within `repository/path`.
pub fn chunk_id(repository: &str, path: &str, ordinal: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(repository.as_bytes());
    hasher.update([0x1f]);
    hasher.update(path.as_bytes());
    hasher.update([0x1f]);
    hasher.update(ordinal.to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..32].to_string()
}

/// Identifiers for a contiguous range of ordinals.
pub fn chunk_ids_for(repository: &str, path: &str, ordinals: Range<usize>) -> Vec<String> {
    ordinals.map(|i| chunk_id(repository, path, i)).collect()
}

/// Normalize raw file content before splitting.
pub fn clean_content(content: &str) -> String {
    content
        .lines()
        .map(|line| {
            line.trim()
                .chars()
                .filter(|c| *c == '\t' || !c.is_control())
                .collect::<String>()
        })
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Split `content` into overlapping windows. Returns the trimmed pieces in
/// order; sizes are counted in characters, never bytes.
pub fn split_text(content: &str, params: &ChunkParams) -> Vec<String> {
    let cleaned = clean_content(content);
    if cleaned.is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = cleaned.chars().collect();
    let max = params.max_chunk_size.max(1);
    if chars.len() <= max {
        return vec![cleaned];
    }

    let mut pieces = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let mut end = (start + max).min(chars.len());
        if end < chars.len() {
            if let Some(pos) = chars[start..end]
                .iter()
                .rposition(|c| matches!(c, '.' | '!' | '?' | '\n'))
            {
                if pos > max / 2 {
                    end = start + pos + 1;
                }
            }
        }

        let piece: String = chars[start..end].iter().collect();
        let piece = piece.trim();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }

        if end >= chars.len() {
            break;
        }
        let next = end.saturating_sub(params.chunk_overlap);
        start = if next > start { next } else { end };
    }
    pieces
}

/// Build [`Chunk`]s with deterministic ids from a change record.
pub fn chunk_record(record: &ChangeRecord, params: &ChunkParams) -> Vec<Chunk> {
    let content = match &record.content {
        Some(c) => c,
        None => return Vec::new(),
    };
    let pieces = split_text(content, params);
    let total = pieces.len();
    let extension = record.extension();

    pieces
        .into_iter()
        .enumerate()
        .map(|(ordinal, text)| Chunk {
            id: chunk_id(&record.repository, &record.path, ordinal),
            ordinal,
            total,
            text,
            metadata: ChunkMetadata {
                repository: record.repository.clone(),
                path: record.path.clone(),
                revision: record.revision.clone(),
                extension: extension.clone(),
                last_modified: record.last_modified,
            },
        })
        .collect()
}

/// In-process [`Chunker`] backed by [`chunk_record`].
#[derive(Debug, Clone, Default)]
pub struct TextChunker;

#[async_trait]
impl Chunker for TextChunker {
    async fn chunk(&self, record: &ChangeRecord, params: &ChunkParams) -> Result<Vec<Chunk>> {
        Ok(chunk_record(record, params))
    }
}
