use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::EmbeddingConfig;
use crate::error::{Result, ZmemError};

const OLLAMA_BASE: &str = "http://localhost:11434";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

/// `/api/embed` takes the whole batch in one request.
#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Client for the Ollama embed API. Batches from the engine go out as a
/// single `/api/embed` request instead of one round-trip per chunk.
pub struct OllamaProvider {
    client: Client,
    base_url: String,
    model: String,
    dimensions: usize,
    request_timeout: Duration,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| OLLAMA_BASE.to_string()),
            model: config.model.clone(),
            dimensions: config.dimensions,
            request_timeout: config
                .request_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        }
    }
}

#[async_trait]
impl super::EmbeddingProvider for OllamaProvider {
    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn health_check(&self) -> Result<bool> {
        // Listing tags doubles as a liveness probe: it confirms the
        // daemon answers API calls, not merely that the port is open
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await;
        Ok(response.map(|r| r.status().is_success()).unwrap_or(false))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let texts = [text.to_string()];
        let mut vectors = self.embed_many(&texts).await?;
        vectors
            .pop()
            .ok_or_else(|| ZmemError::Embedding("ollama returned no embedding".into()))
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .json(&EmbedRequest {
                model: &self.model,
                input: texts,
            })
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| ZmemError::Embedding(format!("ollama unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ZmemError::Embedding(format!(
                "ollama embed failed ({status}): {body}"
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| ZmemError::Embedding(format!("malformed ollama response: {e}")))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(ZmemError::Embedding(format!(
                "ollama returned {} embeddings for {} inputs",
                parsed.embeddings.len(),
                texts.len()
            )));
        }
        if parsed.embeddings.iter().any(|v| v.is_empty()) {
            return Err(ZmemError::Embedding(
                "ollama returned an empty embedding".into(),
            ));
        }
        Ok(parsed.embeddings)
    }
}
