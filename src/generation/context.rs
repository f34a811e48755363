use tracing::debug;

use crate::retrieval::RetrievalResult;

/// The bounded, ordered context a single answer is generated from.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationContext {
    pub query: String,
    /// Results in descending-similarity order, as produced by the retriever
    pub results: Vec<RetrievalResult>,
    /// True when at least one retrieved result did not fit the budget
    pub truncated: bool,
}

/// Select retrieved results into a context bounded by `max_context_chars`.
///
/// Results are consumed in order until the next one would exceed the budget;
/// a chunk either fits whole or is excluded. The one exception: when even the
/// first chunk exceeds the whole budget it is included alone, so a query with
/// at least one relevant chunk always gets an answer attempt.
#[inline]
pub fn assemble(
    query: &str,
    results: Vec<RetrievalResult>,
    max_context_chars: usize,
) -> GenerationContext {
    let total_results = results.len();
    let mut included = Vec::new();
    let mut used_chars = 0;
    let mut truncated = false;

    for result in results {
        let chunk_chars = result.chunk.content.chars().count();

        if included.is_empty() && chunk_chars > max_context_chars {
            truncated = true;
            included.push(result);
            break;
        }

        if used_chars + chunk_chars > max_context_chars {
            truncated = true;
            break;
        }

        used_chars += chunk_chars;
        included.push(result);
    }

    debug!(
        "Assembled context with {}/{} results ({} chars, budget {}, truncated={})",
        included.len(),
        total_results,
        used_chars,
        max_context_chars,
        truncated
    );

    GenerationContext {
        query: query.to_string(),
        results: included,
        truncated,
    }
}
