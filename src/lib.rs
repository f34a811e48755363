use thiserror::Error;

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Embedding provider unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Generation provider unavailable: {0}")]
    GenerationUnavailable(String),

    #[error("No retrieved context available for generation")]
    EmptyContext,

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Vector store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl RagError {
    /// Stable kind name, recorded when the pipeline marks a query as failed.
    #[inline]
    pub fn kind(&self) -> &'static str {
        match self {
            RagError::InvalidConfiguration(_) => "invalid_configuration",
            RagError::InvalidQuery(_) => "invalid_query",
            RagError::EmbeddingUnavailable(_) => "embedding_unavailable",
            RagError::GenerationUnavailable(_) => "generation_unavailable",
            RagError::EmptyContext => "empty_context",
            RagError::DimensionMismatch { .. } => "dimension_mismatch",
            RagError::Store(_) => "store",
            RagError::Io(_) => "io",
            RagError::Other(_) => "other",
        }
    }
}

pub mod chunking;
pub mod commands;
pub mod config;
pub mod database;
pub mod embeddings;
pub mod generation;
pub mod pipeline;
pub mod retrieval;
