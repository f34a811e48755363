// Generation module
// Grounded answer generation over an assembled retrieval context

#[cfg(test)]
mod tests;

pub mod context;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use itertools::Itertools;
use serde::Serialize;
use tracing::debug;

use crate::config::GenerationConfig;
use crate::{RagError, Result};

pub use context::{GenerationContext, assemble};

/// Instructions constraining the model to the supplied context.
const SYSTEM_PROMPT: &str = "\
You are a helpful assistant that answers questions based solely on the provided context.

IMPORTANT INSTRUCTIONS:
1. Only use information from the provided context to answer questions
2. If the answer cannot be found in the context, clearly state that you don't have enough information
3. Do not make up or infer information that is not explicitly stated in the context
4. Be concise and accurate in your responses
5. If relevant, cite which part of the context you're using

Always maintain a professional and helpful tone.";

/// Lazy sequence of answer fragments; finite, not restartable. Dropping it
/// cancels the underlying model request. A provider failure surfaces as one
/// terminal `Err` item; fragments already yielded are never retracted.
pub type FragmentStream = BoxStream<'static, Result<String>>;

/// A single generation call to the external language model.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Capability interface over an external language model.
///
/// Failures map to `GenerationUnavailable` and are never retried here:
/// re-running a generative call duplicates cost without a guaranteed result.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;

    async fn generate_stream(&self, request: &GenerationRequest) -> Result<FragmentStream>;
}

/// Citation of a source the answer was grounded on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceAttribution {
    pub source_ref: String,
    pub similarity: f32,
}

/// A grounded answer, returned to the caller and never persisted here.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub text: String,
    /// Sources in context order
    pub sources: Vec<SourceAttribution>,
    /// True when retrieved results were dropped to fit the context budget
    pub truncated: bool,
}

/// A streamed answer: citations are known up front, text arrives lazily.
pub struct StreamedAnswer {
    pub sources: Vec<SourceAttribution>,
    pub truncated: bool,
    pub fragments: FragmentStream,
}

/// Turns an assembled context into a grounded answer via a provider.
pub struct Generator {
    provider: Arc<dyn GenerationProvider>,
    config: GenerationConfig,
}

impl Generator {
    #[inline]
    pub fn new(provider: Arc<dyn GenerationProvider>, config: GenerationConfig) -> Self {
        Self { provider, config }
    }

    /// Generate a complete answer synchronously.
    #[inline]
    pub async fn answer(&self, context: &GenerationContext) -> Result<Answer> {
        let request = self.request_for(context)?;

        debug!(
            "Generating answer from {} context results",
            context.results.len()
        );
        let text = self.provider.generate(&request).await?;

        Ok(Answer {
            text,
            sources: sources_of(context),
            truncated: context.truncated,
        })
    }

    /// Generate an answer as a lazy fragment stream.
    ///
    /// Citations are resolved from the context before the stream starts, so
    /// callers can render them without waiting for generation to finish.
    #[inline]
    pub async fn answer_stream(&self, context: &GenerationContext) -> Result<StreamedAnswer> {
        let request = self.request_for(context)?;

        debug!(
            "Starting streamed answer from {} context results",
            context.results.len()
        );
        let fragments = self.provider.generate_stream(&request).await?;

        Ok(StreamedAnswer {
            sources: sources_of(context),
            truncated: context.truncated,
            fragments,
        })
    }

    fn request_for(&self, context: &GenerationContext) -> Result<GenerationRequest> {
        if context.results.is_empty() {
            // Answering without context would be ungrounded by definition.
            return Err(RagError::EmptyContext);
        }

        Ok(GenerationRequest {
            system: SYSTEM_PROMPT.to_string(),
            prompt: build_prompt(context),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        })
    }
}

fn sources_of(context: &GenerationContext) -> Vec<SourceAttribution> {
    context
        .results
        .iter()
        .map(|result| SourceAttribution {
            source_ref: result.chunk.source_ref.clone(),
            similarity: result.similarity,
        })
        .collect()
}

fn build_prompt(context: &GenerationContext) -> String {
    let blocks = context
        .results
        .iter()
        .enumerate()
        .map(|(idx, result)| {
            format!(
                "[Document {}] (Source: {}, Relevance: {:.2})\n{}\n",
                idx + 1,
                result.chunk.source_ref,
                result.similarity,
                result.chunk.content
            )
        })
        .join("\n---\n");

    format!(
        "Context Information:\n{}\n\n---\n\nQuestion: {}\n\nPlease answer the question based only on the context information provided above.",
        blocks, context.query
    )
}
