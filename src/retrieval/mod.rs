
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::chunking::Chunk;
use crate::database::lancedb::VectorStore;
use crate::embeddings::{EmbeddingCache, EmbeddingProvider};
use crate::{RagError, Result};

/// Upper bound on the number of results a single query may request.
pub const MAX_TOP_K: usize = 20;

/// A request for the most similar chunks to a piece of text.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalQuery {
    pub text: String,
    /// Maximum number of results; bounds the result count, never pads it.
    pub top_k: usize,
    /// Hard cutoff; results below it are excluded regardless of `top_k`.
    pub similarity_threshold: f32,
}

impl RetrievalQuery {
    #[inline]
    pub fn new(text: impl Into<String>, top_k: usize, similarity_threshold: f32) -> Self {
        Self {
            text: text.into(),
            top_k,
            similarity_threshold,
        }
    }

    /// Reject out-of-range parameters before any external call is made.
    #[inline]
    pub fn validate(&self) -> Result<()> {
        if self.text.trim().is_empty() {
            return Err(RagError::InvalidQuery(
                "query text cannot be empty".to_string(),
            ));
        }
        if !(1..=MAX_TOP_K).contains(&self.top_k) {
            return Err(RagError::InvalidQuery(format!(
                "top_k must be between 1 and {}, got {}",
                MAX_TOP_K, self.top_k
            )));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(RagError::InvalidQuery(format!(
                "similarity_threshold must be between 0.0 and 1.0, got {}",
                self.similarity_threshold
            )));
        }
        Ok(())
    }
}

/// A retrieved chunk with its cosine similarity to the query, in [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalResult {
    pub chunk: Chunk,
    pub similarity: f32,
}

/// Embeds query text and searches the vector store, applying the query's
/// threshold and ranking.
pub struct Retriever {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<VectorStore>,
    cache: Arc<EmbeddingCache>,
    store_timeout: Duration,
}

impl Retriever {
    #[inline]
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<VectorStore>,
        cache: Arc<EmbeddingCache>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            embedder,
            store,
            cache,
            store_timeout,
        }
    }

    /// Retrieve the ranked chunks for a query.
    ///
    /// An empty result is a valid outcome, not an error: it means no indexed
    /// chunk met the threshold.
    #[inline]
    pub async fn retrieve(&self, query: &RetrievalQuery) -> Result<Vec<RetrievalResult>> {
        let vector = self.embed_query(query).await?;
        self.search_embedded(&vector, query).await
    }

    /// Validate the query and embed its text, consulting the cache first.
    #[inline]
    pub async fn embed_query(&self, query: &RetrievalQuery) -> Result<Vec<f32>> {
        query.validate()?;

        match self.cache.get(&query.text) {
            Some(vector) => {
                debug!("Query embedding served from cache");
                Ok(vector)
            }
            None => {
                let vector = self.embedder.embed(&query.text).await?;
                self.cache.insert(&query.text, &vector);
                Ok(vector)
            }
        }
    }

    /// Search the store with an already-embedded query.
    #[inline]
    pub async fn search_embedded(
        &self,
        vector: &[f32],
        query: &RetrievalQuery,
    ) -> Result<Vec<RetrievalResult>> {
        let results = tokio::time::timeout(
            self.store_timeout,
            self.store
                .search(vector, query.top_k, query.similarity_threshold),
        )
        .await
        .map_err(|_| RagError::Store("vector search timed out".to_string()))??;

        debug!(
            "Retrieved {} results for query (top_k={}, threshold={})",
            results.len(),
            query.top_k,
            query.similarity_threshold
        );

        Ok(results)
    }
}
