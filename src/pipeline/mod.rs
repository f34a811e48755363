// Pipeline module
// Composes chunking, embedding, retrieval, context assembly, and generation
// into the indexing and query flows


use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chunking::{chunk_text, normalize_text};
use crate::config::Config;
use crate::database::lancedb::{IndexStats, IndexedChunk, VectorStore};
use crate::embeddings::{EmbeddingCache, EmbeddingProvider};
use crate::generation::{
    Answer, GenerationProvider, Generator, StreamedAnswer, assemble,
};
use crate::retrieval::{RetrievalQuery, RetrievalResult, Retriever};
use crate::{RagError, Result};

const EMBEDDING_CACHE_CAPACITY: usize = 256;

/// Opaque token identifying an already-authenticated caller.
///
/// The pipeline never inspects it; it only tags query traces. Debug output
/// redacts the token value.
#[derive(Clone, PartialEq, Eq)]
pub struct CallerIdentity(String);

impl CallerIdentity {
    #[inline]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CallerIdentity {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CallerIdentity(***)")
    }
}

/// Lifecycle of a single query. Transitions are one-directional; any failure
/// moves straight to `Failed` carrying the originating error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPhase {
    Received,
    Embedding,
    Retrieving,
    Assembling,
    Generating,
    Completed,
    Failed,
}

impl fmt::Display for QueryPhase {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryPhase::Received => "received",
            QueryPhase::Embedding => "embedding",
            QueryPhase::Retrieving => "retrieving",
            QueryPhase::Assembling => "assembling",
            QueryPhase::Generating => "generating",
            QueryPhase::Completed => "completed",
            QueryPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A document handed over by the loader collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDocument {
    pub source_ref: String,
    pub text: String,
}

/// Outcome of indexing a single document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentReport {
    pub source_ref: String,
    pub chunks_total: usize,
    pub chunks_indexed: usize,
    /// Chunks whose embedding permanently failed; siblings are unaffected
    pub chunks_failed: usize,
}

/// Aggregate outcome of indexing a batch of documents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexingStats {
    pub documents_processed: usize,
    pub documents_failed: usize,
    pub chunks_indexed: usize,
    pub chunks_failed: usize,
    pub errors: Vec<String>,
}

/// Composes the indexing flow (chunk, embed, upsert) and the query flow
/// (embed, retrieve, assemble, generate) over shared components.
pub struct Pipeline {
    config: Config,
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<VectorStore>,
    cache: Arc<EmbeddingCache>,
    retriever: Retriever,
    generator: Generator,
}

impl Pipeline {
    #[inline]
    pub fn new(
        config: Config,
        embedder: Arc<dyn EmbeddingProvider>,
        generation: Arc<dyn GenerationProvider>,
        store: Arc<VectorStore>,
    ) -> Self {
        let cache = Arc::new(EmbeddingCache::new(EMBEDDING_CACHE_CAPACITY));
        let store_timeout = Duration::from_secs(config.timeouts.vector_store_secs);
        let retriever = Retriever::new(
            Arc::clone(&embedder),
            Arc::clone(&store),
            Arc::clone(&cache),
            store_timeout,
        );
        let generator = Generator::new(generation, config.generation.clone());

        Self {
            config,
            embedder,
            store,
            cache,
            retriever,
            generator,
        }
    }

    /// Retrieval-only query surface.
    #[inline]
    pub async fn search(&self, query: &RetrievalQuery) -> Result<Vec<RetrievalResult>> {
        self.retriever.retrieve(query).await
    }

    /// Answer a query with a complete, grounded response.
    ///
    /// `Err(EmptyContext)` means no chunk met the threshold; callers should
    /// render a "no grounded answer" response rather than a failure.
    #[inline]
    pub async fn answer(
        &self,
        query: &RetrievalQuery,
        caller: Option<&CallerIdentity>,
    ) -> Result<Answer> {
        let query_id = Uuid::new_v4();
        let mut phase = QueryPhase::Received;
        debug!(
            %query_id,
            caller = caller.map_or("anonymous", CallerIdentity::as_str),
            "Query received: {}",
            query.text
        );

        query
            .validate()
            .map_err(|e| fail(query_id, phase, e))?;

        transition(query_id, &mut phase, QueryPhase::Embedding);
        let vector = self
            .retriever
            .embed_query(query)
            .await
            .map_err(|e| fail(query_id, phase, e))?;

        transition(query_id, &mut phase, QueryPhase::Retrieving);
        let results = self
            .retriever
            .search_embedded(&vector, query)
            .await
            .map_err(|e| fail(query_id, phase, e))?;

        transition(query_id, &mut phase, QueryPhase::Assembling);
        let context = assemble(&query.text, results, self.config.generation.max_context_chars);

        transition(query_id, &mut phase, QueryPhase::Generating);
        let answer = self
            .generator
            .answer(&context)
            .await
            .map_err(|e| fail(query_id, phase, e))?;

        transition(query_id, &mut phase, QueryPhase::Completed);
        info!(
            %query_id,
            sources = answer.sources.len(),
            truncated = answer.truncated,
            "Query completed"
        );
        Ok(answer)
    }

    /// Answer a query as a lazy fragment stream.
    ///
    /// Fragments already delivered are never retracted; a provider failure
    /// mid-stream arrives as the stream's terminal `Err` item. Dropping the
    /// stream cancels generation.
    #[inline]
    pub async fn answer_stream(
        &self,
        query: &RetrievalQuery,
        caller: Option<&CallerIdentity>,
    ) -> Result<StreamedAnswer> {
        let query_id = Uuid::new_v4();
        let mut phase = QueryPhase::Received;
        debug!(
            %query_id,
            caller = caller.map_or("anonymous", CallerIdentity::as_str),
            "Streamed query received: {}",
            query.text
        );

        query
            .validate()
            .map_err(|e| fail(query_id, phase, e))?;

        transition(query_id, &mut phase, QueryPhase::Embedding);
        let vector = self
            .retriever
            .embed_query(query)
            .await
            .map_err(|e| fail(query_id, phase, e))?;

        transition(query_id, &mut phase, QueryPhase::Retrieving);
        let results = self
            .retriever
            .search_embedded(&vector, query)
            .await
            .map_err(|e| fail(query_id, phase, e))?;

        transition(query_id, &mut phase, QueryPhase::Assembling);
        let context = assemble(&query.text, results, self.config.generation.max_context_chars);

        transition(query_id, &mut phase, QueryPhase::Generating);
        let streamed = self
            .generator
            .answer_stream(&context)
            .await
            .map_err(|e| fail(query_id, phase, e))?;

        // Completion (or terminal failure) now belongs to the consumer of the
        // stream; log it as fragments pass through.
        let fragments = streamed
            .fragments
            .inspect(move |item| {
                if let Err(e) = item {
                    error!(%query_id, phase = %QueryPhase::Generating, kind = e.kind(), "Streamed query failed: {}", e);
                }
            })
            .boxed();

        Ok(StreamedAnswer {
            sources: streamed.sources,
            truncated: streamed.truncated,
            fragments,
        })
    }

    /// Index one document: normalize, chunk, embed, upsert.
    ///
    /// The source's previous chunks are removed first so a document that
    /// shrank does not leave stale tail chunks behind. Chunk embeddings go
    /// through the batch endpoint; if the batch call fails, each chunk is
    /// embedded individually so one chunk's permanent failure is reported
    /// per-chunk instead of aborting its siblings.
    #[inline]
    pub async fn index_document(&self, document: &SourceDocument) -> Result<DocumentReport> {
        info!("Indexing document: {}", document.source_ref);

        let normalized = normalize_text(&document.text);
        let chunks = chunk_text(&document.source_ref, &normalized, &self.config.chunking)?;

        self.with_store_timeout(self.store.delete_source(&document.source_ref))
            .await?;
        self.cache.invalidate_all();

        if chunks.is_empty() {
            warn!("Document {} has no indexable content", document.source_ref);
            return Ok(DocumentReport {
                source_ref: document.source_ref.clone(),
                chunks_total: 0,
                chunks_indexed: 0,
                chunks_failed: 0,
            });
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let chunks_total = chunks.len();

        let embeddings: Vec<Option<Vec<f32>>> = match self.embedder.embed_batch(&texts).await {
            Ok(vectors) => vectors.into_iter().map(Some).collect(),
            Err(batch_error) => {
                warn!(
                    "Batch embedding failed for {} ({}), falling back to per-chunk embedding",
                    document.source_ref, batch_error
                );
                let mut vectors = Vec::with_capacity(texts.len());
                for (position, text) in texts.iter().enumerate() {
                    match self.embedder.embed(text).await {
                        Ok(vector) => vectors.push(Some(vector)),
                        Err(e) => {
                            warn!(
                                "Embedding failed for chunk {} of {}: {}",
                                position, document.source_ref, e
                            );
                            vectors.push(None);
                        }
                    }
                }
                vectors
            }
        };

        let records: Vec<IndexedChunk> = chunks
            .into_iter()
            .zip(embeddings)
            .filter_map(|(chunk, embedding)| embedding.map(|e| IndexedChunk::new(chunk, e)))
            .collect();

        let chunks_indexed = records.len();
        let chunks_failed = chunks_total - chunks_indexed;

        if chunks_indexed == 0 {
            return Err(RagError::EmbeddingUnavailable(format!(
                "all {} chunks failed to embed for {}",
                chunks_total, document.source_ref
            )));
        }

        self.with_store_timeout(self.store.upsert(records)).await?;
        self.cache.invalidate_all();

        info!(
            "Indexed document {} ({}/{} chunks)",
            document.source_ref, chunks_indexed, chunks_total
        );

        Ok(DocumentReport {
            source_ref: document.source_ref.clone(),
            chunks_total,
            chunks_indexed,
            chunks_failed,
        })
    }

    /// Index a batch of documents with bounded parallelism.
    ///
    /// One document's failure never blocks the others; per-document errors
    /// are collected into the returned stats.
    #[inline]
    pub async fn index_batch(
        &self,
        documents: Vec<SourceDocument>,
        parallelism: usize,
    ) -> IndexingStats {
        let parallelism = parallelism.max(1);
        info!(
            "Indexing batch of {} documents (parallelism={})",
            documents.len(),
            parallelism
        );

        let reports: Vec<(String, Result<DocumentReport>)> =
            futures::stream::iter(documents.into_iter().map(|document| async move {
                let report = self.index_document(&document).await;
                (document.source_ref, report)
            }))
            .buffer_unordered(parallelism)
            .collect()
            .await;

        let mut stats = IndexingStats::default();
        for (source_ref, report) in reports {
            match report {
                Ok(report) => {
                    stats.documents_processed += 1;
                    stats.chunks_indexed += report.chunks_indexed;
                    stats.chunks_failed += report.chunks_failed;
                    if report.chunks_failed > 0 {
                        stats.errors.push(format!(
                            "{}: {} chunks failed to embed",
                            source_ref, report.chunks_failed
                        ));
                    }
                }
                Err(e) => {
                    error!("Indexing failed for {}: {}", source_ref, e);
                    stats.documents_failed += 1;
                    stats.errors.push(format!("{}: {}", source_ref, e));
                }
            }
        }

        info!(
            "Batch indexing finished: {} documents ok, {} failed, {} chunks indexed",
            stats.documents_processed, stats.documents_failed, stats.chunks_indexed
        );
        stats
    }

    /// Remove every chunk of a source from the index.
    #[inline]
    pub async fn delete_source(&self, source_ref: &str) -> Result<()> {
        self.with_store_timeout(self.store.delete_source(source_ref))
            .await?;
        self.cache.invalidate_all();
        Ok(())
    }

    /// Corpus statistics from the vector store.
    #[inline]
    pub async fn stats(&self) -> Result<IndexStats> {
        self.with_store_timeout(self.store.stats()).await
    }

    async fn with_store_timeout<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(
            Duration::from_secs(self.config.timeouts.vector_store_secs),
            operation,
        )
        .await
        .map_err(|_| RagError::Store("vector store operation timed out".to_string()))?
    }
}

fn transition(query_id: Uuid, phase: &mut QueryPhase, next: QueryPhase) {
    debug!(%query_id, from = %phase, to = %next, "Query state transition");
    *phase = next;
}

fn fail(query_id: Uuid, phase: QueryPhase, error: RagError) -> RagError {
    error!(
        %query_id,
        from = %phase,
        to = %QueryPhase::Failed,
        kind = error.kind(),
        "Query failed: {}",
        error
    );
    error
}
