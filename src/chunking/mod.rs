
use fancy_regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::debug;

use crate::{RagError, Result};

static BLANK_LINE_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n").expect("valid blank line pattern"));
static SPACE_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" +").expect("valid space run pattern"));
static DISALLOWED_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\s.,;:!?()-]").expect("valid character class pattern"));

/// A bounded contiguous slice of source text; the atomic retrieval unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Deterministic identifier, `{source_ref}::{position}`, so re-indexing a
    /// source replaces its chunks instead of duplicating them.
    pub id: String,
    /// The chunk text
    pub content: String,
    /// Identifier of the originating document
    pub source_ref: String,
    /// 0-based window index within the source
    pub position: usize,
    /// Free-form metadata carried alongside the chunk
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Chunk {
    #[inline]
    pub fn new(source_ref: &str, position: usize, content: String) -> Self {
        Self {
            id: format!("{}::{}", source_ref, position),
            content,
            source_ref: source_ref.to_string(),
            position,
            metadata: serde_json::Map::new(),
        }
    }
}

/// Configuration for sliding-window chunking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Window size in characters
    pub chunk_size: usize,
    /// Characters shared between consecutive windows
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            chunk_size: 500,
            overlap: 50,
        }
    }
}

impl ChunkingConfig {
    #[inline]
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(RagError::InvalidConfiguration(
                "chunk_size must be a positive integer".to_string(),
            ));
        }
        if self.overlap >= self.chunk_size {
            return Err(RagError::InvalidConfiguration(format!(
                "overlap ({}) must be smaller than chunk_size ({})",
                self.overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// Normalize whitespace and control characters ahead of chunking.
///
/// Collapses blank-line runs and space runs, strips characters outside the
/// word/space/basic-punctuation classes, and trims the result. Chunking
/// itself never rewrites text, so callers apply this first.
#[inline]
pub fn normalize_text(text: &str) -> String {
    let text = DISALLOWED_CHARS.replace_all(text, "");
    let text = BLANK_LINE_RUNS.replace_all(&text, "\n\n");
    let text = SPACE_RUNS.replace_all(&text, " ");
    text.trim().to_string()
}

/// Split text into overlapping fixed-size character windows.
///
/// Each window after the first starts `chunk_size - overlap` characters after
/// the previous window's start, so every character lands in at least one
/// chunk and consecutive chunks share exactly `overlap` characters (the tail
/// window may be shorter). Text shorter than `chunk_size` yields a single
/// chunk; text that is empty yields none. Windows are measured in `char`s so
/// a multi-byte scalar is never split.
#[inline]
pub fn chunk_text(source_ref: &str, text: &str, config: &ChunkingConfig) -> Result<Vec<Chunk>> {
    config.validate()?;

    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Ok(Vec::new());
    }

    let mut chunks = Vec::new();

    if chars.len() <= config.chunk_size {
        chunks.push(Chunk::new(source_ref, 0, text.to_string()));
    } else {
        let stride = config.chunk_size - config.overlap;
        let mut position = 0;
        loop {
            let start = position * stride;
            if start >= chars.len() {
                break;
            }
            let end = (start + config.chunk_size).min(chars.len());
            let content: String = chars[start..end].iter().collect();
            chunks.push(Chunk::new(source_ref, position, content));
            if end == chars.len() {
                break;
            }
            position += 1;
        }
    }

    let total = chunks.len();
    for chunk in &mut chunks {
        chunk
            .metadata
            .insert("total_chunks".to_string(), serde_json::json!(total));
    }

    debug!(
        "Chunked source '{}' into {} chunks (chunk_size={}, overlap={})",
        source_ref, total, config.chunk_size, config.overlap
    );

    Ok(chunks)
}
