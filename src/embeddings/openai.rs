use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::EmbeddingConfig;
use crate::error::{Result, ZmemError};

const OPENAI_BASE: &str = "https://api.openai.com";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Serialize)]
pub(crate) struct EmbeddingsRequest {
    pub model: String,
    pub input: Vec<String>,
}

#[derive(Deserialize)]
pub(crate) struct EmbeddingsResponse {
    pub data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
pub(crate) struct EmbeddingDatum {
    pub index: usize,
    pub embedding: Vec<f32>,
}

/// Client for the OpenAI `/v1/embeddings` endpoint (or any compatible
/// server). Supports true batching: one request per batch of texts.
pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
    request_timeout: Duration,
}

impl OpenAiProvider {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| OPENAI_BASE.to_string()),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            dimensions: config.dimensions,
            request_timeout: config
                .request_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        }
    }
}

/// Issue one embeddings request and return vectors in input order.
pub(crate) async fn request_embeddings(
    client: &Client,
    base_url: &str,
    api_key: Option<&str>,
    model: &str,
    texts: &[String],
    timeout: Duration,
) -> Result<Vec<Vec<f32>>> {
    let request = EmbeddingsRequest {
        model: model.to_string(),
        input: texts.to_vec(),
    };

    let mut builder = client
        .post(format!("{base_url}/v1/embeddings"))
        .json(&request)
        .timeout(timeout);
    if let Some(key) = api_key {
        builder = builder.bearer_auth(key);
    }

    let response = builder
        .send()
        .await
        .map_err(|e| ZmemError::Embedding(format!("embeddings endpoint unreachable: {e}")))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(ZmemError::Embedding(format!(
            "embeddings endpoint returned {status}: {body}"
        )));
    }

    let result: EmbeddingsResponse = response
        .json()
        .await
        .map_err(|e| ZmemError::Embedding(format!("failed to parse embeddings: {e}")))?;

    if result.data.len() != texts.len() {
        return Err(ZmemError::Embedding(format!(
            "endpoint returned {} embeddings for {} inputs",
            result.data.len(),
            texts.len()
        )));
    }

    let mut ordered = result.data;
    ordered.sort_by_key(|d| d.index);
    Ok(ordered.into_iter().map(|d| d.embedding).collect())
}

#[async_trait]
impl super::EmbeddingProvider for OpenAiProvider {
    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn health_check(&self) -> Result<bool> {
        let mut builder = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .timeout(std::time::Duration::from_secs(3));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        match builder.send().await {
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
            self.api_key.as_deref(),
            &self.model,
            texts,
            self.request_timeout,
        )
        .await
    }
}
