#[cfg(test)]
mod tests;

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::Config;
use crate::embeddings::EmbeddingProvider;
use crate::generation::{FragmentStream, GenerationProvider, GenerationRequest};
use crate::{RagError, Result};

pub const DEFAULT_EMBEDDING_DIMENSION: u32 = 768;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const EXPONENTIAL_BACKOFF_BASE: u32 = 2;
const CONNECT_TIMEOUT_SECONDS: u64 = 5;

/// Client for an Ollama server, covering both capabilities the pipeline
/// needs: embeddings (`/api/embed`) and answer generation (`/api/generate`).
///
/// Embedding calls retry with exponential backoff on transport errors, 429,
/// and 5xx before surfacing `EmbeddingUnavailable`. Generation calls are
/// never retried.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: Url,
    embedding_model: String,
    chat_model: String,
    embedding_dimension: usize,
    batch_size: usize,
    client: Client,
    request_timeout: Duration,
    retry_attempts: u32,
    retry_backoff: Duration,
}

#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    prompt: String,
}

#[derive(Debug, Serialize)]
struct BatchEmbedRequest {
    model: String,
    #[serde(rename = "input")]
    inputs: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Serialize)]
struct GenerateApiRequest {
    model: String,
    prompt: String,
    system: String,
    stream: bool,
    options: GenerateApiOptions,
}

#[derive(Debug, Serialize)]
struct GenerateApiOptions {
    temperature: f32,
    num_predict: i64,
}

/// Payload shape shared by the sync response and each NDJSON stream line.
#[derive(Debug, Deserialize)]
struct GenerateApiResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ModelInfo {
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    models: Vec<ModelInfo>,
}

impl OllamaClient {
    #[inline]
    pub fn new(config: &Config) -> Result<Self> {
        let base_url = config.ollama.base_url()?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECONDS))
            .build()
            .map_err(|e| {
                RagError::InvalidConfiguration(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            base_url,
            embedding_model: config.ollama.embedding_model.clone(),
            chat_model: config.ollama.chat_model.clone(),
            embedding_dimension: config.ollama.embedding_dimension as usize,
            batch_size: config.ollama.batch_size as usize,
            client,
            request_timeout: Duration::from_secs(config.timeouts.provider_request_secs),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_backoff: Duration::from_secs(1),
        })
    }

    #[inline]
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    #[inline]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Test connection to the Ollama server and verify both configured
    /// models are available.
    #[inline]
    pub async fn health_check(&self) -> Result<()> {
        debug!("Performing health check for Ollama at {}", self.base_url);

        let models = self.list_models().await?;
        let names: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();

        for model in [&self.embedding_model, &self.chat_model] {
            if !names.contains(&model.as_str()) {
                warn!("Model {} not found. Available models: {:?}", model, names);
                return Err(RagError::InvalidConfiguration(format!(
                    "Model '{}' is not available. Available models: {:?}",
                    model, names
                )));
            }
        }

        info!(
            "Health check passed for Ollama server at {} (embedding={}, chat={})",
            self.base_url, self.embedding_model, self.chat_model
        );
        Ok(())
    }

    /// List all models installed on the server
    #[inline]
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = self.endpoint("/api/tags")?;
        debug!("Fetching available models from {}", url);

        let response = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| {
                RagError::EmbeddingUnavailable(format!("Failed to reach Ollama server: {}", e))
            })?;

        if !response.status().is_success() {
            return Err(RagError::EmbeddingUnavailable(format!(
                "Model listing failed: HTTP {}",
                response.status()
            )));
        }

        let models_response: ModelsResponse = response.json().await.map_err(|e| {
            RagError::EmbeddingUnavailable(format!("Failed to parse models response: {}", e))
        })?;

        debug!("Found {} models", models_response.models.len());
        Ok(models_response.models)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).map_err(|e| {
            RagError::InvalidConfiguration(format!("Failed to build URL for {}: {}", path, e))
        })
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.embedding_dimension {
            return Err(RagError::DimensionMismatch {
                expected: self.embedding_dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// POST a JSON payload with bounded retry for the embedding endpoints.
    ///
    /// Transport errors, 429 and 5xx are retryable; any other HTTP error
    /// fails immediately.
    async fn post_embed_with_retry<T: Serialize + Sync>(
        &self,
        url: &Url,
        payload: &T,
    ) -> Result<String> {
        let mut last_error = None;

        for attempt in 1..=self.retry_attempts {
            debug!("HTTP request attempt {}/{}", attempt, self.retry_attempts);

            match self
                .client
                .post(url.clone())
                .timeout(self.request_timeout)
                .json(payload)
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        debug!("Request succeeded on attempt {}", attempt);
                        return response.text().await.map_err(|e| {
                            RagError::EmbeddingUnavailable(format!(
                                "Failed to read response body: {}",
                                e
                            ))
                        });
                    }

                    let retryable = status.is_server_error() || status.as_u16() == 429;
                    let body = response.text().await.unwrap_or_default();
                    if !retryable {
                        warn!("Client error (status {}), not retrying", status);
                        return Err(RagError::EmbeddingUnavailable(format!(
                            "HTTP {}: {}",
                            status, body
                        )));
                    }

                    warn!(
                        "Server error (status {}), attempt {}/{}",
                        status, attempt, self.retry_attempts
                    );
                    last_error = Some(RagError::EmbeddingUnavailable(format!(
                        "HTTP {}: {}",
                        status, body
                    )));
                }
                Err(e) => {
                    warn!(
                        "Transport error: {}, attempt {}/{}",
                        e, attempt, self.retry_attempts
                    );
                    last_error = Some(RagError::EmbeddingUnavailable(format!(
                        "Transport error: {}",
                        e
                    )));
                }
            }

            if attempt < self.retry_attempts {
                let delay = self.retry_backoff * EXPONENTIAL_BACKOFF_BASE.pow(attempt - 1);
                debug!("Waiting {:?} before retry", delay);
                tokio::time::sleep(delay).await;
            }
        }

        error!("All retry attempts failed for request to {}", self.base_url);

        Err(last_error.unwrap_or_else(|| {
            RagError::EmbeddingUnavailable("Request failed after retries".to_string())
        }))
    }

    async fn embed_single_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.len() == 1 {
            let vector = self.embed(&texts[0]).await?;
            return Ok(vec![vector]);
        }

        let request = BatchEmbedRequest {
            model: self.embedding_model.clone(),
            inputs: texts.to_vec(),
        };

        let url = self.endpoint("/api/embed")?;
        let response_text = self.post_embed_with_retry(&url, &request).await?;

        let batch_response: BatchEmbedResponse =
            serde_json::from_str(&response_text).map_err(|e| {
                RagError::EmbeddingUnavailable(format!(
                    "Failed to parse batch embedding response: {}",
                    e
                ))
            })?;

        if batch_response.embeddings.len() != texts.len() {
            return Err(RagError::EmbeddingUnavailable(format!(
                "Mismatch between request and response counts: {} vs {}",
                texts.len(),
                batch_response.embeddings.len()
            )));
        }

        for embedding in &batch_response.embeddings {
            self.check_dimension(embedding)?;
        }

        Ok(batch_response.embeddings)
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaClient {
    #[inline]
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        debug!("Generating embedding for text (length: {})", text.len());

        let request = EmbedRequest {
            model: self.embedding_model.clone(),
            prompt: text.to_string(),
        };

        let url = self.endpoint("/api/embed")?;
        let response_text = self.post_embed_with_retry(&url, &request).await?;

        let embed_response: EmbedResponse = serde_json::from_str(&response_text).map_err(|e| {
            RagError::EmbeddingUnavailable(format!("Failed to parse embedding response: {}", e))
        })?;

        self.check_dimension(&embed_response.embedding)?;

        debug!(
            "Generated embedding with {} dimensions",
            embed_response.embedding.len()
        );
        Ok(embed_response.embedding)
    }

    #[inline]
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!("Generating embeddings for {} texts", texts.len());

        let mut results = Vec::with_capacity(texts.len());
        // Sub-batch to avoid overwhelming the server; order is preserved.
        for batch in texts.chunks(self.batch_size) {
            let batch_results = self.embed_single_batch(batch).await?;
            results.extend(batch_results);
        }

        debug!("Generated {} embeddings total", results.len());
        Ok(results)
    }
}

#[async_trait]
impl GenerationProvider for OllamaClient {
    #[inline]
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        debug!(
            "Generating answer with model {} (prompt length: {})",
            self.chat_model,
            request.prompt.len()
        );

        let api_request = GenerateApiRequest {
            model: self.chat_model.clone(),
            prompt: request.prompt.clone(),
            system: request.system.clone(),
            stream: false,
            options: GenerateApiOptions {
                temperature: request.temperature,
                num_predict: i64::from(request.max_tokens),
            },
        };

        let url = self.endpoint("/api/generate")?;
        let response = self
            .client
            .post(url)
            .timeout(self.request_timeout)
            .json(&api_request)
            .send()
            .await
            .map_err(|e| RagError::GenerationUnavailable(format!("Transport error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RagError::GenerationUnavailable(format!(
                "HTTP {}: {}",
                status, body
            )));
        }

        let api_response: GenerateApiResponse = response.json().await.map_err(|e| {
            RagError::GenerationUnavailable(format!("Failed to parse generation response: {}", e))
        })?;

        if let Some(message) = api_response.error {
            return Err(RagError::GenerationUnavailable(message));
        }

        debug!(
            "Generated answer ({} characters)",
            api_response.response.len()
        );
        Ok(api_response.response)
    }

    #[inline]
    async fn generate_stream(&self, request: &GenerationRequest) -> Result<FragmentStream> {
        debug!(
            "Starting streamed generation with model {} (prompt length: {})",
            self.chat_model,
            request.prompt.len()
        );

        let api_request = GenerateApiRequest {
            model: self.chat_model.clone(),
            prompt: request.prompt.clone(),
            system: request.system.clone(),
            stream: true,
            options: GenerateApiOptions {
                temperature: request.temperature,
                num_predict: i64::from(request.max_tokens),
            },
        };

        let url = self.endpoint("/api/generate")?;
        // No overall timeout here: a streamed answer legitimately outlives the
        // per-request budget, and dropping the stream cancels the connection.
        let response = self
            .client
            .post(url)
            .json(&api_request)
            .send()
            .await
            .map_err(|e| RagError::GenerationUnavailable(format!("Transport error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RagError::GenerationUnavailable(format!(
                "HTTP {}: {}",
                status, body
            )));
        }

        let state = NdjsonState {
            inner: response
                .bytes_stream()
                .map(|chunk| chunk.map(|b| b.to_vec()))
                .boxed(),
            buffer: Vec::new(),
            finished: false,
        };

        Ok(futures::stream::unfold(state, next_fragment).boxed())
    }
}

struct NdjsonState {
    inner: futures::stream::BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: Vec<u8>,
    finished: bool,
}

/// Pull the next answer fragment out of the NDJSON response stream.
///
/// Any upstream failure becomes a single terminal `Err` item; the stream
/// yields nothing after it.
async fn next_fragment(mut state: NdjsonState) -> Option<(Result<String>, NdjsonState)> {
    loop {
        if state.finished {
            return None;
        }

        if let Some(newline) = state.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = state.buffer.drain(..=newline).collect();
            match parse_stream_line(&line) {
                Ok(None) => {}
                Ok(Some(StreamEvent::Fragment { text, done })) => {
                    if done {
                        state.finished = true;
                    }
                    return Some((Ok(text), state));
                }
                Ok(Some(StreamEvent::Done)) => {
                    state.finished = true;
                    return None;
                }
                Err(e) => {
                    state.finished = true;
                    return Some((Err(e), state));
                }
            }
            continue;
        }

        match state.inner.next().await {
            Some(Ok(bytes)) => state.buffer.extend_from_slice(&bytes),
            Some(Err(e)) => {
                state.finished = true;
                return Some((
                    Err(RagError::GenerationUnavailable(format!(
                        "Stream transport error: {}",
                        e
                    ))),
                    state,
                ));
            }
            None => {
                state.finished = true;
                // A final line without a trailing newline still counts.
                let line = std::mem::take(&mut state.buffer);
                return match parse_stream_line(&line) {
                    Ok(Some(StreamEvent::Fragment { text, .. })) => Some((Ok(text), state)),
                    Ok(_) => None,
                    Err(e) => Some((Err(e), state)),
                };
            }
        }
    }
}

enum StreamEvent {
    Fragment { text: String, done: bool },
    Done,
}

fn parse_stream_line(line: &[u8]) -> Result<Option<StreamEvent>> {
    let trimmed = line
        .iter()
        .copied()
        .skip_while(|b| b.is_ascii_whitespace())
        .collect::<Vec<u8>>();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let payload: GenerateApiResponse = serde_json::from_slice(&trimmed).map_err(|e| {
        RagError::GenerationUnavailable(format!("Invalid stream payload: {}", e))
    })?;

    if let Some(message) = payload.error {
        return Err(RagError::GenerationUnavailable(message));
    }

    if payload.response.is_empty() {
        if payload.done {
            return Ok(Some(StreamEvent::Done));
        }
        return Ok(None);
    }

    Ok(Some(StreamEvent::Fragment {
        text: payload.response,
        done: payload.done,
    }))
}
