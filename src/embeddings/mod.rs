// Embeddings module
// Capability interface over external embedding models plus the Ollama provider

pub mod cache;
pub mod ollama;

use async_trait::async_trait;

use crate::Result;

pub use cache::EmbeddingCache;
pub use ollama::OllamaClient;

/// Capability interface over an external embedding model.
///
/// Implementations map text to fixed-length dense vectors; the dimensionality
/// is configuration, not part of this trait. Transient transport failures are
/// retried inside the provider before surfacing as `EmbeddingUnavailable`.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Batch form, purely for throughput. Semantics are identical to calling
    /// `embed` per item in order: no reordering, no deduplication.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}
