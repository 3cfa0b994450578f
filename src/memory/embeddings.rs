//! Embedding models via the local Ollama runtime or a hash fallback
//!
//! Supports:
//! - Ollama embeddings (`/api/embed`, e.g. all-minilm)
//! - Local hash-based fallback (free, no download, lower quality)

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Turns text into a vector for similarity search
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Human-readable model name
    fn name(&self) -> &str;
}

/// Available embedding providers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Local Ollama runtime
    #[default]
    Ollama,
    /// Hash-based fallback (no model, lower quality)
    Hash,
}

impl std::fmt::Display for EmbeddingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ollama => write!(f, "Ollama"),
            Self::Hash => write!(f, "Hash"),
        }
    }
}

/// Embedding model configuration
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    /// Model name (provider-specific)
    pub model_name: String,
    /// Ollama base URL
    pub base_url: String,
    /// Embedding dimension (hash provider only)
    pub embedding_dim: usize,
    /// Maximum input length in characters
    pub max_chars: usize,
    pub timeout: Duration,
    pub cache_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Ollama,
            model_name: "all-minilm".to_string(),
            base_url: "http://localhost:11434".to_string(),
            embedding_dim: 384,
            max_chars: 2048,
            timeout: Duration::from_secs(10),
            cache_size: 1000,
        }
    }
}

impl EmbeddingConfig {
    /// Build from the `[embedding]` and `[ollama]` config sections
    pub fn from_settings(settings: &crate::config::EmbeddingSettings, base_url: &str) -> Self {
        Self {
            provider: settings.provider.clone(),
            model_name: settings.model.clone(),
            base_url: base_url.to_string(),
            embedding_dim: settings.dimension,
            timeout: Duration::from_secs(settings.timeout_secs),
            cache_size: settings.cache_size,
            ..Default::default()
        }
    }

    /// Create config for hash-based fallback (no dependencies)
    pub fn hash() -> Self {
        Self {
            provider: EmbeddingProvider::Hash,
            model_name: "hash-based".to_string(),
            ..Default::default()
        }
    }
}

/// Embedding model wrapper supporting multiple backends
pub struct EmbeddingModel {
    config: EmbeddingConfig,
    client: Client,
    /// Cache for recently computed embeddings
    cache: Arc<RwLock<lru::LruCache<String, Vec<f32>>>>,
}

impl EmbeddingModel {
    /// Create a new embedding model with the given configuration
    pub fn new(config: EmbeddingConfig) -> Result<Self> {
        info!("Initializing embedding model: {} ({})", config.model_name, config.provider);

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build embedding HTTP client")?;

        let capacity = NonZeroUsize::new(config.cache_size).unwrap_or(NonZeroUsize::MIN);
        let cache = Arc::new(RwLock::new(lru::LruCache::new(capacity)));

        Ok(Self {
            config,
            client,
            cache,
        })
    }

    /// Generate an embedding for the given text
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let cache_key = self.cache_key(text);
        {
            let mut cache = self.cache.write().await;
            if let Some(cached) = cache.get(&cache_key) {
                return Ok(cached.clone());
            }
        }

        let embedding = match self.config.provider {
            EmbeddingProvider::Ollama => self.embed_via_ollama(text).await?,
            EmbeddingProvider::Hash => self.embed_hash(text),
        };

        {
            let mut cache = self.cache.write().await;
            cache.put(cache_key, embedding.clone());
        }

        Ok(embedding)
    }

    /// Generate embedding via Ollama `/api/embed`
    async fn embed_via_ollama(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embed", self.config.base_url.trim_end_matches('/'));
        let request = EmbeddingRequest {
            model: self.config.model_name.clone(),
            input: vec![self.truncate_text(text).to_string()],
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to send embedding request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            warn!("Embedding API error ({}): {}", status, error_text);
            return Err(anyhow::anyhow!("Embedding API error ({}): {}", status, error_text));
        }

        let result: EmbeddingResponse = response
            .json()
            .await
            .context("Failed to parse embedding response")?;

        result
            .embeddings
            .into_iter()
            .next()
            .filter(|e| !e.is_empty())
            .ok_or_else(|| anyhow::anyhow!("No embedding in response"))
    }

    /// Hash-based embedding (deterministic, no model needed)
    fn embed_hash(&self, text: &str) -> Vec<f32> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let dim = self.config.embedding_dim.max(1);
        let mut embedding = vec![0.0f32; dim];

        // Bag of lowercased words, so shared vocabulary means higher similarity
        for token in text.split_whitespace() {
            let token = token
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            if token.is_empty() {
                continue;
            }
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let hash = hasher.finish();

            for (j, slot) in embedding.iter_mut().enumerate() {
                let mut hasher = DefaultHasher::new();
                hash.hash(&mut hasher);
                (j as u64).hash(&mut hasher);
                let val = hasher.finish();
                let normalized = (val as f64 / u64::MAX as f64) * 2.0 - 1.0;
                *slot += normalized as f32;
            }
        }

        let mag: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if mag > 0.0 {
            for val in embedding.iter_mut() {
                *val /= mag;
            }
        }

        embedding
    }

    /// Truncate text to the configured character budget
    fn truncate_text<'a>(&self, text: &'a str) -> &'a str {
        match text.char_indices().nth(self.config.max_chars) {
            Some((idx, _)) => &text[..idx],
            None => text,
        }
    }

    fn cache_key(&self, text: &str) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        format!("{:x}", hasher.finish())
    }

    pub fn model_name(&self) -> &str {
        &self.config.model_name
    }
}

#[async_trait]
impl Embedder for EmbeddingModel {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        EmbeddingModel::embed(self, text).await
    }

    fn name(&self) -> &str {
        self.model_name()
    }
}

/// Ollama embedding request
#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

/// Ollama embedding response
#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_embedding() {
        let model = EmbeddingModel::new(EmbeddingConfig::hash()).unwrap();

        let emb1 = model.embed("hello world").await.unwrap();
        let emb2 = model.embed("hello world").await.unwrap();
        let emb3 = model.embed("goodbye moon").await.unwrap();

        assert_eq!(emb1, emb2);
        assert_ne!(emb1, emb3);

        let mag: f32 = emb1.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((mag - 1.0).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_hash_embedding_shared_words_are_closer() {
        let model = EmbeddingModel::new(EmbeddingConfig::hash()).unwrap();

        let query = model.embed("favourite rust crate").await.unwrap();
        let near = model.embed("my favourite crate is tokio").await.unwrap();
        let far = model.embed("weather tomorrow looks rainy").await.unwrap();

        assert!(cosine_similarity(&query, &near) > cosine_similarity(&query, &far));
    }

    #[tokio::test]
    async fn test_unreachable_ollama_errors() {
        let config = EmbeddingConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            timeout: Duration::from_millis(500),
            ..Default::default()
        };
        let model = EmbeddingModel::new(config).unwrap();
        assert!(model.embed("hello").await.is_err());
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        let c = vec![0.0, 1.0, 0.0];

        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.001);
        assert!((cosine_similarity(&a, &c) - 0.0).abs() < 0.001);
        assert_eq!(cosine_similarity(&a, &[1.0, 0.0]), 0.0);
    }
}
