use super::*;
use crate::config::OllamaConfig;
use crate::generation::GenerationRequest;
use futures::StreamExt;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TEST_DIMENSION: u32 = 4;

fn test_config(server: &MockServer, dimension: u32) -> Config {
    Config {
        ollama: OllamaConfig {
            host: server.address().ip().to_string(),
            port: server.address().port(),
            embedding_dimension: dimension,
            ..OllamaConfig::default()
        },
        ..Config::default()
    }
}

fn fast_client(server: &MockServer) -> OllamaClient {
    OllamaClient::new(&test_config(server, TEST_DIMENSION))
        .expect("should create client")
        .with_retry_backoff(Duration::from_millis(10))
}

fn generation_request() -> GenerationRequest {
    GenerationRequest {
        system: "answer from context".to_string(),
        prompt: "Context...\n\nQuestion: why?".to_string(),
        max_tokens: 100,
        temperature: 0.7,
    }
}

#[test]
fn client_configuration() {
    let config = Config {
        ollama: OllamaConfig {
            protocol: "http".to_string(),
            host: "test-host".to_string(),
            port: 1234,
            embedding_model: "test-embed".to_string(),
            chat_model: "test-chat".to_string(),
            batch_size: 128,
            embedding_dimension: 512,
        },
        ..Config::default()
    };
    let client = OllamaClient::new(&config).expect("should create client");

    assert_eq!(client.embedding_model, "test-embed");
    assert_eq!(client.chat_model, "test-chat");
    assert_eq!(client.batch_size, 128);
    assert_eq!(client.embedding_dimension, 512);
    assert_eq!(client.base_url.host_str(), Some("test-host"));
    assert_eq!(client.base_url.port(), Some(1234));
    assert_eq!(client.retry_attempts, DEFAULT_RETRY_ATTEMPTS);
}

#[tokio::test]
async fn embed_returns_vector() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"embedding": [0.1, 0.2, 0.3, 0.4]})),
        )
        .mount(&server)
        .await;

    let client = fast_client(&server);
    let vector = client.embed("hello world").await.expect("should embed");

    assert_eq!(vector, vec![0.1, 0.2, 0.3, 0.4]);
}

#[tokio::test]
async fn embed_retries_transient_failures_transparently() {
    let server = MockServer::start().await;

    // Two server errors, then success; the caller should observe no error.
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"embedding": [1.0, 0.0, 0.0, 0.0]})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = fast_client(&server);
    let vector = client.embed("hello").await.expect("should embed after retries");

    assert_eq!(vector, vec![1.0, 0.0, 0.0, 0.0]);
}

#[tokio::test]
async fn embed_gives_up_after_bounded_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let client = fast_client(&server);
    let result = client.embed("hello").await;

    assert!(matches!(result, Err(RagError::EmbeddingUnavailable(_))));
}

#[tokio::test]
async fn embed_does_not_retry_client_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "bad model"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = fast_client(&server);
    let result = client.embed("hello").await;

    assert!(matches!(result, Err(RagError::EmbeddingUnavailable(_))));
}

#[tokio::test]
async fn embed_rejects_unexpected_dimension() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"embedding": [0.1, 0.2]})))
        .mount(&server)
        .await;

    let client = fast_client(&server);
    let result = client.embed("hello").await;

    assert!(matches!(
        result,
        Err(RagError::DimensionMismatch {
            expected: 4,
            actual: 2
        })
    ));
}

#[tokio::test]
async fn batch_embedding_preserves_input_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_partial_json(json!({"input": ["first", "second", "third"]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "embeddings": [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0]
            ]
        })))
        .mount(&server)
        .await;

    let client = fast_client(&server);
    let texts = vec![
        "first".to_string(),
        "second".to_string(),
        "third".to_string(),
    ];
    let vectors = client.embed_batch(&texts).await.expect("should embed batch");

    assert_eq!(vectors.len(), 3);
    assert_eq!(vectors[0], vec![1.0, 0.0, 0.0, 0.0]);
    assert_eq!(vectors[1], vec![0.0, 1.0, 0.0, 0.0]);
    assert_eq!(vectors[2], vec![0.0, 0.0, 1.0, 0.0]);
}

#[tokio::test]
async fn batch_embedding_rejects_count_mismatch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "embeddings": [[1.0, 0.0, 0.0, 0.0]]
        })))
        .mount(&server)
        .await;

    let client = fast_client(&server);
    let texts = vec!["first".to_string(), "second".to_string()];
    let result = client.embed_batch(&texts).await;

    assert!(matches!(result, Err(RagError::EmbeddingUnavailable(_))));
}

#[tokio::test]
async fn empty_batch_makes_no_requests() {
    let server = MockServer::start().await;

    let client = fast_client(&server);
    let vectors = client.embed_batch(&[]).await.expect("should succeed");

    assert!(vectors.is_empty());
    assert!(server.received_requests().await.expect("requests").is_empty());
}

#[tokio::test]
async fn generate_returns_answer_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({"stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response": "The answer is in the context.",
            "done": true
        })))
        .mount(&server)
        .await;

    let client = fast_client(&server);
    let text = client
        .generate(&generation_request())
        .await
        .expect("should generate");

    assert_eq!(text, "The answer is in the context.");
}

#[tokio::test]
async fn generation_failures_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let client = fast_client(&server);
    let result = client.generate(&generation_request()).await;

    assert!(matches!(result, Err(RagError::GenerationUnavailable(_))));
}

#[tokio::test]
async fn generate_stream_yields_fragments_in_order() {
    let server = MockServer::start().await;
    let ndjson = concat!(
        "{\"response\":\"The \",\"done\":false}\n",
        "{\"response\":\"answer\",\"done\":false}\n",
        "{\"response\":\".\",\"done\":false}\n",
        "{\"response\":\"\",\"done\":true}\n",
    );
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(ndjson.as_bytes().to_vec(), "application/x-ndjson"),
        )
        .mount(&server)
        .await;

    let client = fast_client(&server);
    let stream = client
        .generate_stream(&generation_request())
        .await
        .expect("should start stream");

    let fragments: Vec<String> = stream
        .map(|f| f.expect("fragment should be ok"))
        .collect()
        .await;
    assert_eq!(fragments, vec!["The ", "answer", "."]);
}

#[tokio::test]
async fn generate_stream_surfaces_error_as_terminal_event() {
    let server = MockServer::start().await;
    let ndjson = concat!(
        "{\"response\":\"Par\",\"done\":false}\n",
        "{\"error\":\"model crashed\"}\n",
    );
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(ndjson.as_bytes().to_vec(), "application/x-ndjson"),
        )
        .mount(&server)
        .await;

    let client = fast_client(&server);
    let stream = client
        .generate_stream(&generation_request())
        .await
        .expect("should start stream");

    let items: Vec<crate::Result<String>> = stream.collect().await;
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_deref().expect("first fragment ok"), "Par");
    assert!(matches!(items[1], Err(RagError::GenerationUnavailable(_))));
}

#[tokio::test]
async fn generate_stream_rejects_http_errors_up_front() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = fast_client(&server);
    let result = client.generate_stream(&generation_request()).await;

    assert!(matches!(result, Err(RagError::GenerationUnavailable(_))));
}

#[tokio::test]
async fn health_check_verifies_both_models() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [
                {"name": "nomic-embed-text:latest"},
                {"name": "llama3.1:latest"}
            ]
        })))
        .mount(&server)
        .await;

    let client = fast_client(&server);
    client.health_check().await.expect("health check should pass");
}

#[tokio::test]
async fn health_check_fails_on_missing_model() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [{"name": "nomic-embed-text:latest"}]
        })))
        .mount(&server)
        .await;

    let client = fast_client(&server);
    let result = client.health_check().await;

    assert!(matches!(result, Err(RagError::InvalidConfiguration(_))));
}
