use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::config::EmbeddingConfig;
use crate::error::{Result, ZmemError};

use super::openai::request_embeddings;

/// llama-server listens locally and speaks the OpenAI embeddings protocol.
const LLAMACPP_BASE: &str = "http://127.0.0.1:8080";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Client for a local llama.cpp server (`llama-server --embedding`).
/// Wire format is OpenAI-compatible; no authentication.
pub struct LlamaCppProvider {
    client: Client,
    base_url: String,
    model: String,
    dimensions: usize,
    request_timeout: Duration,
}

impl LlamaCppProvider {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| LLAMACPP_BASE.to_string()),
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
impl super::EmbeddingProvider for LlamaCppProvider {
    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// llama-server exposes a /health endpoint that turns 200 once the
    /// model is loaded.
    async fn health_check(&self) -> Result<bool> {
        let resp = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(std::time::Duration::from_secs(3))
            .send()
            .await;
        match resp {
            Ok(r) => Ok(r.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let texts = [text.to_string()];
        let mut vectors = self.embed_many(&texts).await?;
        vectors
            .pop()
            .ok_or_else(|| ZmemError::Embedding("empty embedding response".into()))
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        request_embeddings(
            &self.client,
            &self.base_url,
            None,
            &self.model,
            texts,
            self.request_timeout,
        )
        .await
    }
}
