use super::*;
use crate::chunking::Chunk;
use crate::retrieval::RetrievalResult;
use futures::StreamExt;
use std::sync::Mutex;

struct RecordingProvider {
    last_request: Mutex<Option<GenerationRequest>>,
    response: String,
}

impl RecordingProvider {
    fn new(response: &str) -> Self {
        Self {
            last_request: Mutex::new(None),
            response: response.to_string(),
        }
    }

    fn take_request(&self) -> Option<GenerationRequest> {
        self.last_request
            .lock()
            .expect("request mutex poisoned")
            .take()
    }
}

#[async_trait::async_trait]
impl GenerationProvider for RecordingProvider {
    async fn generate(&self, request: &GenerationRequest) -> crate::Result<String> {
        *self.last_request.lock().expect("request mutex poisoned") = Some(request.clone());
        Ok(self.response.clone())
    }

    async fn generate_stream(&self, request: &GenerationRequest) -> crate::Result<FragmentStream> {
        *self.last_request.lock().expect("request mutex poisoned") = Some(request.clone());
        let fragments: Vec<crate::Result<String>> = self
            .response
            .split_inclusive(' ')
            .map(|s| Ok(s.to_string()))
            .collect();
        Ok(futures::stream::iter(fragments).boxed())
    }
}

struct FailingProvider;

#[async_trait::async_trait]
impl GenerationProvider for FailingProvider {
    async fn generate(&self, _request: &GenerationRequest) -> crate::Result<String> {
        Err(RagError::GenerationUnavailable("model offline".to_string()))
    }

    async fn generate_stream(
        &self,
        _request: &GenerationRequest,
    ) -> crate::Result<FragmentStream> {
        let items: Vec<crate::Result<String>> = vec![
            Ok("partial ".to_string()),
            Err(RagError::GenerationUnavailable("connection lost".to_string())),
        ];
        Ok(futures::stream::iter(items).boxed())
    }
}

fn context_with_results(results: Vec<RetrievalResult>, truncated: bool) -> GenerationContext {
    GenerationContext {
        query: "What is the refund policy?".to_string(),
        results,
        truncated,
    }
}

fn result(source_ref: &str, position: usize, content: &str, similarity: f32) -> RetrievalResult {
    RetrievalResult {
        chunk: Chunk::new(source_ref, position, content.to_string()),
        similarity,
    }
}

#[tokio::test]
async fn empty_context_is_rejected() {
    let generator = Generator::new(
        Arc::new(RecordingProvider::new("unused")),
        crate::config::GenerationConfig::default(),
    );
    let context = context_with_results(Vec::new(), false);

    assert!(matches!(
        generator.answer(&context).await,
        Err(RagError::EmptyContext)
    ));
    assert!(matches!(
        generator.answer_stream(&context).await,
        Err(RagError::EmptyContext)
    ));
}

#[tokio::test]
async fn answer_carries_sources_and_truncation() {
    let provider = Arc::new(RecordingProvider::new("Refunds are issued within 30 days."));
    let generator = Generator::new(
        Arc::clone(&provider) as Arc<dyn GenerationProvider>,
        crate::config::GenerationConfig::default(),
    );
    let context = context_with_results(
        vec![
            result("policies.md", 0, "Refunds within 30 days.", 0.92),
            result("faq.md", 3, "Contact support for refunds.", 0.81),
        ],
        true,
    );

    let answer = generator.answer(&context).await.expect("should answer");

    assert_eq!(answer.text, "Refunds are issued within 30 days.");
    assert!(answer.truncated);
    assert_eq!(answer.sources.len(), 2);
    assert_eq!(answer.sources[0].source_ref, "policies.md");
    assert!((answer.sources[0].similarity - 0.92).abs() < f32::EPSILON);
    assert_eq!(answer.sources[1].source_ref, "faq.md");
}

#[tokio::test]
async fn prompt_contains_numbered_context_blocks() {
    let provider = Arc::new(RecordingProvider::new("ok"));
    let generator = Generator::new(
        Arc::clone(&provider) as Arc<dyn GenerationProvider>,
        crate::config::GenerationConfig::default(),
    );
    let context = context_with_results(
        vec![
            result("policies.md", 0, "Refunds within 30 days.", 0.92),
            result("faq.md", 3, "Contact support for refunds.", 0.81),
        ],
        false,
    );

    generator.answer(&context).await.expect("should answer");

    let request = provider.take_request().expect("request should be recorded");
    assert!(request.system.contains("based solely on the provided context"));
    assert!(request.prompt.contains("[Document 1] (Source: policies.md, Relevance: 0.92)"));
    assert!(request.prompt.contains("[Document 2] (Source: faq.md, Relevance: 0.81)"));
    assert!(request.prompt.contains("Refunds within 30 days."));
    assert!(request.prompt.contains("Question: What is the refund policy?"));
    assert_eq!(request.max_tokens, 1000);
    assert!((request.temperature - 0.7).abs() < f32::EPSILON);
}

#[tokio::test]
async fn streamed_fragments_concatenate_to_full_answer() {
    let provider = Arc::new(RecordingProvider::new("Refunds are issued within 30 days."));
    let generator = Generator::new(
        Arc::clone(&provider) as Arc<dyn GenerationProvider>,
        crate::config::GenerationConfig::default(),
    );
    let context = context_with_results(
        vec![result("policies.md", 0, "Refunds within 30 days.", 0.92)],
        false,
    );

    let streamed = generator
        .answer_stream(&context)
        .await
        .expect("should start stream");
    assert_eq!(streamed.sources.len(), 1);
    assert!(!streamed.truncated);

    let fragments: Vec<String> = streamed
        .fragments
        .map(|f| f.expect("fragment should be ok"))
        .collect()
        .await;
    assert!(fragments.len() > 1);
    assert_eq!(fragments.concat(), "Refunds are issued within 30 days.");
}

#[tokio::test]
async fn stream_failure_is_a_terminal_event() {
    let generator = Generator::new(
        Arc::new(FailingProvider),
        crate::config::GenerationConfig::default(),
    );
    let context = context_with_results(
        vec![result("policies.md", 0, "Refunds within 30 days.", 0.92)],
        false,
    );

    let streamed = generator
        .answer_stream(&context)
        .await
        .expect("stream should start");
    let items: Vec<crate::Result<String>> = streamed.fragments.collect().await;

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_deref().expect("first fragment ok"), "partial ");
    assert!(matches!(
        items[1],
        Err(RagError::GenerationUnavailable(_))
    ));
}

#[tokio::test]
async fn generation_failure_propagates() {
    let generator = Generator::new(
        Arc::new(FailingProvider),
        crate::config::GenerationConfig::default(),
    );
    let context = context_with_results(
        vec![result("policies.md", 0, "Refunds within 30 days.", 0.92)],
        false,
    );

    assert!(matches!(
        generator.answer(&context).await,
        Err(RagError::GenerationUnavailable(_))
    ));
}
