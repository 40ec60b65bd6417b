//! Embedding providers and the engine facade.
//!
//! The embedding-model runtime is an external collaborator reached over
//! HTTP. Three providers are supported: `llamacpp` (llama-server),
//! `openai` (or any OpenAI-compatible endpoint), and `ollama`. The engine
//! owns the provider lifecycle, splits batches, normalises vectors, and
//! verifies that every requested id comes back.

pub mod llamacpp;
pub mod ollama;
pub mod openai;

use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;

use crate::config::{EmbeddingConfig, EmbeddingProviderKind};
use crate::error::{Result, ZmemError};

/// Capability interface for an embedding backend.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model(&self) -> &str;
    fn dimensions(&self) -> usize;

    /// Whether the backend is reachable and serving the configured model.
    async fn health_check(&self) -> Result<bool>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts in one call where the backend supports it.
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// One text to embed, keyed by its chunk id.
#[derive(Debug, Clone)]
pub struct EmbeddingInput {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct EmbeddingOutput {
    pub id: String,
    pub vector: Vec<f32>,
    pub dimensions: usize,
}

const STATE_NEW: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_DISPOSED: u8 = 2;

/// Facade over the configured provider. `embed` before `initialize` or
/// after `dispose` is an error; embedding failures surface as
/// [`ZmemError::Embedding`] — there is no fallback to zero vectors.
pub struct EmbeddingEngine {
    provider: Box<dyn EmbeddingProvider>,
    batch_size: usize,
    state: AtomicU8,
}

impl EmbeddingEngine {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        let provider: Box<dyn EmbeddingProvider> = match config.provider {
            EmbeddingProviderKind::Llamacpp => {
                Box::new(llamacpp::LlamaCppProvider::new(config))
            }
            EmbeddingProviderKind::Openai => Box::new(openai::OpenAiProvider::new(config)),
            EmbeddingProviderKind::Ollama => Box::new(ollama::OllamaProvider::new(config)),
        };
        Self::with_provider(provider, config.batch_size)
    }

    pub fn with_provider(provider: Box<dyn EmbeddingProvider>, batch_size: usize) -> Self {
        Self {
            provider,
            batch_size: batch_size.max(1),
            state: AtomicU8::new(STATE_NEW),
        }
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }

    /// Check the backend and mark the engine ready.
    pub async fn initialize(&self) -> Result<()> {
        if self.state.load(Ordering::Acquire) == STATE_DISPOSED {
            return Err(ZmemError::Embedding(
                "embedding engine already disposed".into(),
            ));
        }
        match self.provider.health_check().await {
            Ok(true) => {
                self.state.store(STATE_READY, Ordering::Release);
                tracing::info!(
                    "Embedding provider ready: {} ({}D)",
                    self.provider.model(),
                    self.provider.dimensions()
                );
                Ok(())
            }
            Ok(false) => Err(ZmemError::Embedding(format!(
                "embedding provider '{}' failed health check",
                self.provider.model()
            ))),
            Err(e) => Err(e),
        }
    }

    pub async fn health_check(&self) -> Result<bool> {
        self.provider.health_check().await
    }

    /// Release the provider. Further embed calls fail.
    pub fn dispose(&self) {
        self.state.store(STATE_DISPOSED, Ordering::Release);
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state.load(Ordering::Acquire) {
            STATE_READY => Ok(()),
            STATE_DISPOSED => Err(ZmemError::Embedding(
                "embedding engine already disposed".into(),
            )),
            _ => Err(ZmemError::Embedding(
                "embedding engine not initialized".into(),
            )),
        }
    }

    /// Embed one text into a unit-length vector.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.ensure_ready()?;
        let mut vector = self.provider.embed(text).await?;
        self.check_dimensions(vector.len())?;
        l2_normalize(&mut vector);
        Ok(vector)
    }

    /// Embed a set of id-keyed texts. Every requested id is guaranteed to
    /// be present in the output, in input order.
    pub async fn embed_batch(&self, inputs: &[EmbeddingInput]) -> Result<Vec<EmbeddingOutput>> {
        self.ensure_ready()?;
        let mut out = Vec::with_capacity(inputs.len());
        for batch in inputs.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|i| i.text.clone()).collect();
            let vectors = self.provider.embed_many(&texts).await?;
            if vectors.len() != batch.len() {
                return Err(ZmemError::Embedding(format!(
                    "provider returned {} embeddings for {} inputs",
                    vectors.len(),
                    batch.len()
                )));
            }
            for (input, mut vector) in batch.iter().zip(vectors) {
                self.check_dimensions(vector.len())?;
                l2_normalize(&mut vector);
                out.push(EmbeddingOutput {
                    id: input.id.clone(),
                    dimensions: vector.len(),
                    vector,
                });
            }
        }
        Ok(out)
    }

    fn check_dimensions(&self, got: usize) -> Result<()> {
        let expected = self.provider.dimensions();
        if got != expected {
            return Err(ZmemError::Embedding(format!(
                "provider returned {got}-dimensional vector, expected {expected}"
            )));
        }
        Ok(())
    }
}

/// Scale a vector to unit length in place; a zero vector is left as-is.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Deterministic in-process provider for tests: a bag-of-words hash
    //! embedding, so identical texts map to identical vectors and shared
    //! vocabulary yields positive cosine similarity.

    use std::hash::{Hash, Hasher};

    use super::*;

    pub struct HashProvider {
        dimensions: usize,
    }

    impl HashProvider {
        pub fn new(dimensions: usize) -> Self {
            Self { dimensions }
        }

        fn embed_sync(&self, text: &str) -> Vec<f32> {
            let mut vector = vec![0.0f32; self.dimensions];
            for token in text
                .to_lowercase()
                .split(|c: char| !c.is_alphanumeric())
                .filter(|t| !t.is_empty())
            {
                // DefaultHasher::new() uses fixed keys, so this is stable
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                token.hash(&mut hasher);
                let h = hasher.finish();
                let idx = (h % self.dimensions as u64) as usize;
                let sign = if (h >> 32) & 1 == 0 { 1.0 } else { -1.0 };
                vector[idx] += sign;
            }
            vector
        }
    }

    #[async_trait]
    impl EmbeddingProvider for HashProvider {
        fn model(&self) -> &str {
            "hash-test"
        }

        fn dimensions(&self) -> usize {
            self.dimensions
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            Ok(self.embed_sync(text))
        }
    }

    /// A ready-to-use engine over the hash provider.
    pub async fn hash_engine(dimensions: usize) -> EmbeddingEngine {
        let engine =
            EmbeddingEngine::with_provider(Box::new(HashProvider::new(dimensions)), 8);
        engine.initialize().await.expect("hash provider is always healthy");
        engine
    }
}
