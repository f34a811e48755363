// LanceDB vector database module
// Handles vector storage and cosine similarity search for indexed chunks

pub mod vector_store;

use chrono::{SecondsFormat, Utc};

use crate::chunking::Chunk;

pub use vector_store::VectorStore;

/// The unit of storage and retrieval: a chunk plus its embedding vector.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedChunk {
    pub chunk: Chunk,
    /// Dense vector with the index-wide configured dimensionality
    pub embedding: Vec<f32>,
    /// RFC 3339 with microsecond precision so lexicographic order matches
    /// insertion order.
    pub created_at: String,
}

impl IndexedChunk {
    #[inline]
    pub fn new(chunk: Chunk, embedding: Vec<f32>) -> Self {
        Self {
            chunk,
            embedding,
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        }
    }
}

/// Corpus statistics reported by the vector store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexStats {
    pub count: u64,
    pub earliest_created_at: Option<String>,
    pub latest_created_at: Option<String>,
}
