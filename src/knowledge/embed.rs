//! Embedding client and the batching/retry service around it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::{IngestConfig, ModelConfig};
use crate::llm::{parse_retry_after, retry_with_policy, LlmError, RetryPolicy};
use crate::util::truncate;

/// Input cap per text (about 8k tokens at 4 chars/token).
pub const MAX_EMBED_INPUT_BYTES: usize = 32_000;

/// Anything that turns texts into fixed-dimension vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// One vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError>;

    fn dimension(&self) -> usize;
}

/// Client for an OpenAI-compatible `/embeddings` endpoint.
pub struct EmbeddingClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    dimension: usize,
}

impl EmbeddingClient {
    pub fn new(api_key: String, base_url: String, model: String, dimension: usize) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            dimension,
        }
    }

    pub fn from_config(config: &ModelConfig) -> Self {
        Self::new(
            config.api_key.clone(),
            config.base_url.clone(),
            config.embed_model.clone(),
            config.embed_dimension,
        )
    }

    fn embeddings_url(&self) -> String {
        format!("{}/embeddings", self.base_url)
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let request = EmbeddingRequest {
            model: &self.model,
            input: texts
                .iter()
                .map(|t| truncate(t, MAX_EMBED_INPUT_BYTES))
                .collect(),
        };

        let resp = self
            .client
            .post(self.embeddings_url())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("X-Title", "MindOp")
            .json(&request)
            .send()
            .await
            .map_err(LlmError::from_reqwest)?;

        let status = resp.status();
        let retry_after = parse_retry_after(resp.headers());
        let text = resp.text().await.map_err(LlmError::from_reqwest)?;

        if !status.is_success() {
            return Err(LlmError::from_status(status.as_u16(), &text, retry_after));
        }

        let response: EmbeddingResponse = serde_json::from_str(&text).map_err(|e| {
            LlmError::parse_error(format!(
                "Failed to parse embedding response: {} - {}",
                e,
                truncate(&text, 500)
            ))
        })?;

        // Sort by index and extract embeddings
        let mut data = response.data;
        data.sort_by_key(|d| d.index);
        if data.len() != texts.len() {
            return Err(LlmError::parse_error(format!(
                "Expected {} embeddings, got {}",
                texts.len(),
                data.len()
            )));
        }

        let embeddings: Vec<Vec<f32>> = data.into_iter().map(|d| d.embedding).collect();
        for (i, emb) in embeddings.iter().enumerate() {
            if emb.len() != self.dimension {
                tracing::warn!(
                    "Embedding {} has dimension {} but expected {}",
                    i,
                    emb.len(),
                    self.dimension
                );
            }
        }

        Ok(embeddings)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// Result of embedding a sequence of chunks.
#[derive(Debug, Clone)]
pub struct EmbeddedChunks {
    /// Positionally aligned with the input texts
    pub embeddings: Vec<Vec<f32>>,
    /// How many entries are zero-vector substitutes
    pub zero_vector_fallbacks: usize,
}

/// Applies batching, pacing and retry on top of an [`Embedder`].
#[derive(Clone)]
pub struct EmbeddingService {
    embedder: Arc<dyn Embedder>,
    retry_policy: RetryPolicy,
    batch_size: usize,
    batch_delay: Duration,
}

impl EmbeddingService {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        retry_policy: RetryPolicy,
        batch_size: usize,
        batch_delay: Duration,
    ) -> Self {
        Self {
            embedder,
            retry_policy,
            batch_size: batch_size.max(1),
            batch_delay,
        }
    }

    pub fn from_config(embedder: Arc<dyn Embedder>, config: &IngestConfig) -> Self {
        Self::new(
            embedder,
            RetryPolicy::with_max_retries(config.embed_max_retries),
            config.embed_batch_size,
            config.embed_batch_delay,
        )
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn dimension(&self) -> usize {
        self.embedder.dimension()
    }

    /// Embed a query. Failure after retries is returned to the caller.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let input = [text.to_string()];
        let mut vectors = retry_with_policy(&self.retry_policy, "Query embedding", |_| {
            self.embedder.embed_batch(&input)
        })
        .await?;
        vectors
            .pop()
            .ok_or_else(|| LlmError::parse_error("No embedding returned".to_string()))
    }

    /// Embed chunk texts in paced batches.
    ///
    /// A batch that still fails after retries is retried item by item; an
    /// item that still fails gets a zero vector so the run keeps going.
    pub async fn embed_chunks(&self, texts: &[String]) -> EmbeddedChunks {
        let mut embeddings = Vec::with_capacity(texts.len());
        let mut zero_vector_fallbacks = 0;
        let batch_count = texts.len().div_ceil(self.batch_size);

        for (batch_idx, batch) in texts.chunks(self.batch_size).enumerate() {
            if batch_idx > 0 && !self.batch_delay.is_zero() {
                tokio::time::sleep(self.batch_delay).await;
            }

            let result = retry_with_policy(&self.retry_policy, "Embedding batch", |_| {
                self.embedder.embed_batch(batch)
            })
            .await;

            match result {
                Ok(vectors) if vectors.len() == batch.len() => embeddings.extend(vectors),
                outcome => {
                    match outcome {
                        Err(e) => tracing::warn!(
                            "Embedding batch {}/{} failed, retrying items individually: {}",
                            batch_idx + 1,
                            batch_count,
                            e
                        ),
                        Ok(vectors) => tracing::warn!(
                            "Embedding batch {}/{} returned {} vectors for {} inputs",
                            batch_idx + 1,
                            batch_count,
                            vectors.len(),
                            batch.len()
                        ),
                    }
                    for text in batch {
                        match self.embed_one(text).await {
                            Some(vector) => embeddings.push(vector),
                            None => {
                                zero_vector_fallbacks += 1;
                                embeddings.push(vec![0.0; self.dimension()]);
                            }
                        }
                    }
                }
            }
        }

        if zero_vector_fallbacks > 0 {
            tracing::warn!(
                "{} of {} chunks stored with zero-vector embeddings",
                zero_vector_fallbacks,
                texts.len()
            );
        }

        EmbeddedChunks {
            embeddings,
            zero_vector_fallbacks,
        }
    }

    async fn embed_one(&self, text: &str) -> Option<Vec<f32>> {
        let input = [text.to_string()];
        match retry_with_policy(&self.retry_policy, "Embedding item", |_| {
            self.embedder.embed_batch(&input)
        })
        .await
        {
            Ok(mut vectors) if vectors.len() == 1 => vectors.pop(),
            Ok(_) => None,
            Err(e) => {
                tracing::error!("Giving up on chunk embedding: {}", e);
                None
            }
        }
    }
}
