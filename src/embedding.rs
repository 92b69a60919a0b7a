//! Embedding providers for query and document vectors.
//!
//! Supports Ollama (local) and OpenAI-compatible (cloud) providers resolved
//! from environment variables. When no provider is configured the embedder is
//! unavailable and every semantic operation degrades to an empty result set;
//! a deterministic hash embedder can be selected explicitly for local runs.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::types::error::EmbedderError;

/// Batch size used by `embed_batch`.
pub const EMBED_BATCH_SIZE: usize = 16;

/// Low-level embedding service. Implementations must be safe for concurrent
/// calls.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, EmbedderError>;

    async fn generate_batch_embeddings(
        &self,
        texts: Vec<&str>,
    ) -> Result<Vec<Vec<f32>>, EmbedderError>;

    fn embedding_dimension(&self) -> usize;

    /// Identifying key for the provider+model; recorded by the store so a
    /// changed embedder across restarts triggers a vector reindex.
    fn version_key(&self) -> String;
}

/// Provider selection.
#[derive(Debug, Clone, PartialEq)]
pub enum EmbeddingProvider {
    Ollama,
    OpenAi,
    /// Deterministic hash embedder; only used when explicitly requested.
    Hash,
}

/// Resolved embedding configuration.
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub dimension: usize,
    pub timeout_seconds: u64,
}

impl EmbeddingConfig {
    /// Resolve embedding configuration from environment variables.
    ///
    /// Returns `None` if no provider can be determined, which leaves the
    /// embedder unavailable (not mocked; similarity search must return
    /// empty rather than degrade to keyword matching).
    pub fn from_env(default_dimension: usize) -> Option<Self> {
        let api_key = std::env::var("EMBEDDING_API_KEY")
            .ok()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|k| !k.is_empty());

        let base_url = std::env::var("EMBEDDING_API_BASE_URL")
            .ok()
            .filter(|u| !u.is_empty());

        let explicit = std::env::var("EMBEDDING_PROVIDER")
            .ok()
            .filter(|p| !p.is_empty());

        let provider = if let Some(ref p) = explicit {
            match p.to_lowercase().as_str() {
                "ollama" => EmbeddingProvider::Ollama,
                "openai" => EmbeddingProvider::OpenAi,
                "hash" => EmbeddingProvider::Hash,
                _ => return None,
            }
        } else if let Some(ref url) = base_url {
            if url.contains("localhost") || url.contains("127.0.0.1") {
                EmbeddingProvider::Ollama
            } else if api_key.is_some() {
                EmbeddingProvider::OpenAi
            } else {
                return None;
            }
        } else if api_key.is_some() {
            EmbeddingProvider::OpenAi
        } else {
            return None;
        };

        let (default_model, default_url, default_dim) = match provider {
            EmbeddingProvider::Ollama => (
                "nomic-embed-text".to_string(),
                "http://localhost:11434".to_string(),
                768,
            ),
            EmbeddingProvider::OpenAi => (
                "text-embedding-3-small".to_string(),
                "https://api.openai.com/v1".to_string(),
                1536,
            ),
            EmbeddingProvider::Hash => ("hash".to_string(), String::new(), default_dimension),
        };

        let model = std::env::var("EMBEDDING_MODEL")
            .ok()
            .filter(|m| !m.is_empty())
            .unwrap_or(default_model);

        let dimension = std::env::var("PARALLAX_VECTOR_DIM")
            .ok()
            .and_then(|d| d.parse::<usize>().ok())
            .unwrap_or(default_dim);

        Some(Self {
            provider,
            model,
            base_url: base_url.unwrap_or(default_url),
            api_key,
            dimension,
            timeout_seconds: 30,
        })
    }
}

/// Ollama embedding service using the native `/api/embed` endpoint.
pub struct OllamaEmbeddingService {
    client: reqwest::Client,
    model: String,
    base_url: String,
    dimension: usize,
}

impl OllamaEmbeddingService {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbedderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| EmbedderError {
                reason: format!("failed to create HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            dimension: config.dimension,
        })
    }
}

#[async_trait]
impl EmbeddingService for OllamaEmbeddingService {
    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        let mut results = self.generate_batch_embeddings(vec![text]).await?;
        results.pop().ok_or_else(|| EmbedderError {
            reason: "empty response from Ollama".to_string(),
        })
    }

    async fn generate_batch_embeddings(
        &self,
        texts: Vec<&str>,
    ) -> Result<Vec<Vec<f32>>, EmbedderError> {
        let url = format!("{}/api/embed", self.base_url);
        let body = serde_json::json!({ "model": self.model, "input": texts });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EmbedderError {
                reason: format!("Ollama request failed: {e}"),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body_text = resp.text().await.unwrap_or_default();
            return Err(EmbedderError {
                reason: format!("Ollama returned {status}: {body_text}"),
            });
        }

        let json: serde_json::Value = resp.json().await.map_err(|e| EmbedderError {
            reason: format!("failed to parse Ollama response: {e}"),
        })?;

        parse_embedding_array(json.get("embeddings"), "embeddings")
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }

    fn version_key(&self) -> String {
        format!("ollama:{}:{}", self.model, self.dimension)
    }
}

/// OpenAI-compatible embedding service.
pub struct OpenAiEmbeddingService {
    client: reqwest::Client,
    model: String,
    base_url: String,
    api_key: String,
    dimension: usize,
}

impl OpenAiEmbeddingService {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbedderError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| EmbedderError {
                reason: "OpenAI embedding service requires an API key".to_string(),
            })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| EmbedderError {
                reason: format!("failed to create HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            dimension: config.dimension,
        })
    }
}

#[async_trait]
impl EmbeddingService for OpenAiEmbeddingService {
    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        let mut results = self.generate_batch_embeddings(vec![text]).await?;
        results.pop().ok_or_else(|| EmbedderError {
            reason: "empty response from embedding endpoint".to_string(),
        })
    }

    async fn generate_batch_embeddings(
        &self,
        texts: Vec<&str>,
    ) -> Result<Vec<Vec<f32>>, EmbedderError> {
        let url = format!("{}/embeddings", self.base_url);
        let body = serde_json::json!({ "model": self.model, "input": texts });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EmbedderError {
                reason: format!("embedding request failed: {e}"),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body_text = resp.text().await.unwrap_or_default();
            return Err(EmbedderError {
                reason: format!("embedding endpoint returned {status}: {body_text}"),
            });
        }

        let json: serde_json::Value = resp.json().await.map_err(|e| EmbedderError {
            reason: format!("failed to parse embedding response: {e}"),
        })?;

        if let Some(usage) = json.get("usage") {
            tracing::debug!(
                prompt_tokens = usage.get("prompt_tokens").and_then(|v| v.as_u64()),
                total_tokens = usage.get("total_tokens").and_then(|v| v.as_u64()),
                "embedding token usage"
            );
        }

        let data = json
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| EmbedderError {
                reason: "missing 'data' field in embedding response".to_string(),
            })?;

        // Sort by index to guarantee input ordering.
        let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
        for item in data {
            let index = item.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
            let embedding = parse_embedding_array(item.get("embedding"), "embedding")?
                .pop()
                .ok_or_else(|| EmbedderError {
                    reason: "missing 'embedding' in response item".to_string(),
                })?;
            indexed.push((index, embedding));
        }
        indexed.sort_by_key(|(i, _)| *i);
        Ok(indexed.into_iter().map(|(_, e)| e).collect())
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }

    fn version_key(&self) -> String {
        format!("openai:{}:{}", self.model, self.dimension)
    }
}

fn parse_embedding_array(
    value: Option<&serde_json::Value>,
    field: &str,
) -> Result<Vec<Vec<f32>>, EmbedderError> {
    // Accepts either a flat vector (single embedding) or an array of vectors.
    let value = value.ok_or_else(|| EmbedderError {
        reason: format!("missing '{field}' field in embedding response"),
    })?;
    let arr = value.as_array().ok_or_else(|| EmbedderError {
        reason: format!("invalid '{field}' field in embedding response"),
    })?;

    let single = arr.first().map(|v| v.is_number()).unwrap_or(false);
    let rows: Vec<&serde_json::Value> = if single { vec![value] } else { arr.iter().collect() };

    rows.into_iter()
        .map(|row| {
            row.as_array()
                .ok_or_else(|| EmbedderError {
                    reason: "invalid embedding array".to_string(),
                })?
                .iter()
                .map(|v| {
                    v.as_f64().map(|f| f as f32).ok_or_else(|| EmbedderError {
                        reason: "invalid float in embedding".to_string(),
                    })
                })
                .collect()
        })
        .collect()
}

/// Deterministic, normalized hash embedder. Same text always maps to the
/// same unit vector; used in tests and explicitly-opted-in local runs.
pub struct HashEmbeddingService {
    dimension: usize,
}

impl HashEmbeddingService {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        use sha2::{Digest, Sha256};
        let mut vec = vec![0.0f32; self.dimension];
        for (pos, token) in text.to_lowercase().split_whitespace().enumerate() {
            let digest = Sha256::digest(token.as_bytes());
            let idx = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
                % self.dimension;
            let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
            vec[idx] += sign / (1.0 + pos as f32 * 0.01);
        }
        let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vec {
                *x /= norm;
            }
        } else {
            vec[0] = 1.0;
        }
        vec
    }
}

#[async_trait]
impl EmbeddingService for HashEmbeddingService {
    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        Ok(self.embed_one(text))
    }

    async fn generate_batch_embeddings(
        &self,
        texts: Vec<&str>,
    ) -> Result<Vec<Vec<f32>>, EmbedderError> {
        Ok(texts.into_iter().map(|t| self.embed_one(t)).collect())
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }

    fn version_key(&self) -> String {
        format!("hash:{}", self.dimension)
    }
}

/// Readiness of the embedder facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedderState {
    Uninitialized,
    Ready,
    Unavailable,
}

enum Resolved {
    Service(Arc<dyn EmbeddingService>),
    Unavailable,
}

/// Facade over the configured embedding service with lazy initialization.
///
/// Per-call failures return `None`; callers degrade gracefully (no embedding
/// stored, cache lookups miss, similarity search returns empty).
pub struct Embedder {
    cell: OnceCell<Resolved>,
    fallback_dimension: usize,
}

impl Embedder {
    pub fn new(fallback_dimension: usize) -> Self {
        Self {
            cell: OnceCell::new(),
            fallback_dimension,
        }
    }

    /// Build an embedder backed by an explicit service (tests, local runs).
    pub fn with_service(service: Arc<dyn EmbeddingService>) -> Self {
        let cell = OnceCell::new();
        let dimension = service.embedding_dimension();
        cell.set(Resolved::Service(service)).ok();
        Self {
            cell,
            fallback_dimension: dimension,
        }
    }

    /// Build a permanently unavailable embedder (degradation paths).
    pub fn unavailable(dimension: usize) -> Self {
        let cell = OnceCell::new();
        cell.set(Resolved::Unavailable).ok();
        Self {
            cell,
            fallback_dimension: dimension,
        }
    }

    async fn resolve(&self) -> &Resolved {
        self.cell
            .get_or_init(|| async {
                match EmbeddingConfig::from_env(self.fallback_dimension) {
                    Some(config) => match create_embedding_service(&config) {
                        Ok(service) => {
                            tracing::info!(
                                version = %service.version_key(),
                                "embedding service ready"
                            );
                            Resolved::Service(service)
                        }
                        Err(e) => {
                            tracing::warn!("embedding service failed to initialize: {e}");
                            Resolved::Unavailable
                        }
                    },
                    None => {
                        tracing::info!("no embedding provider configured, semantic search disabled");
                        Resolved::Unavailable
                    }
                }
            })
            .await
    }

    pub fn state(&self) -> EmbedderState {
        match self.cell.get() {
            None => EmbedderState::Uninitialized,
            Some(Resolved::Service(_)) => EmbedderState::Ready,
            Some(Resolved::Unavailable) => EmbedderState::Unavailable,
        }
    }

    pub fn dimension(&self) -> usize {
        match self.cell.get() {
            Some(Resolved::Service(s)) => s.embedding_dimension(),
            _ => self.fallback_dimension,
        }
    }

    /// Version key of the active service, or `None` when unavailable.
    pub async fn version_key(&self) -> Option<String> {
        match self.resolve().await {
            Resolved::Service(s) => Some(s.version_key()),
            Resolved::Unavailable => None,
        }
    }

    /// Embed one text. `None` means the embedder is unavailable or the call
    /// failed; never an error.
    pub async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        match self.resolve().await {
            Resolved::Service(s) => match s.generate_embedding(text).await {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!("embedding failed: {e}");
                    None
                }
            },
            Resolved::Unavailable => None,
        }
    }

    /// Embed many texts in batches of [`EMBED_BATCH_SIZE`]. `None` mirrors
    /// the single-call degradation contract.
    pub async fn embed_batch(&self, texts: &[String]) -> Option<Vec<Vec<f32>>> {
        let service = match self.resolve().await {
            Resolved::Service(s) => s.clone(),
            Resolved::Unavailable => return None,
        };
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(EMBED_BATCH_SIZE) {
            let refs: Vec<&str> = chunk.iter().map(|s| s.as_str()).collect();
            match service.generate_batch_embeddings(refs).await {
                Ok(mut vecs) => out.append(&mut vecs),
                Err(e) => {
                    tracing::warn!("batch embedding failed: {e}");
                    return None;
                }
            }
        }
        Some(out)
    }
}

/// Cosine similarity of two vectors. Zero when dimensions mismatch.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// Create an embedding service from a resolved config.
pub fn create_embedding_service(
    config: &EmbeddingConfig,
) -> Result<Arc<dyn EmbeddingService>, EmbedderError> {
    match config.provider {
        EmbeddingProvider::Ollama => {
            tracing::info!(model = %config.model, url = %config.base_url, "using Ollama embeddings");
            Ok(Arc::new(OllamaEmbeddingService::new(config)?))
        }
        EmbeddingProvider::OpenAi => {
            tracing::info!(model = %config.model, url = %config.base_url, "using OpenAI embeddings");
            Ok(Arc::new(OpenAiEmbeddingService::new(config)?))
        }
        EmbeddingProvider::Hash => Ok(Arc::new(HashEmbeddingService::new(config.dimension))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for var in &[
            "EMBEDDING_PROVIDER",
            "EMBEDDING_API_KEY",
            "OPENAI_API_KEY",
            "EMBEDDING_API_BASE_URL",
            "EMBEDDING_MODEL",
            "PARALLAX_VECTOR_DIM",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn config_defaults_ollama() {
        clear_env();
        std::env::set_var("EMBEDDING_PROVIDER", "ollama");
        let config = EmbeddingConfig::from_env(384).expect("should resolve");
        assert_eq!(config.provider, EmbeddingProvider::Ollama);
        assert_eq!(config.model, "nomic-embed-text");
        assert_eq!(config.dimension, 768);
        clear_env();
    }

    #[test]
    #[serial]
    fn config_none_when_unconfigured() {
        clear_env();
        assert!(EmbeddingConfig::from_env(384).is_none());
    }

    #[test]
    #[serial]
    fn config_auto_detects_openai_from_key() {
        clear_env();
        std::env::set_var("OPENAI_API_KEY", "sk-test");
        let config = EmbeddingConfig::from_env(384).expect("should resolve");
        assert_eq!(config.provider, EmbeddingProvider::OpenAi);
        clear_env();
    }

    #[tokio::test]
    async fn hash_embedder_is_deterministic_and_normalized() {
        let svc = HashEmbeddingService::new(128);
        let a = svc.generate_embedding("cosine similarity").await.unwrap();
        let b = svc.generate_embedding("cosine similarity").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 128);
        let mag: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((mag - 1.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn related_texts_score_above_unrelated() {
        let svc = HashEmbeddingService::new(256);
        let a = svc
            .generate_embedding("define cardinal cosine similarity")
            .await
            .unwrap();
        let b = svc
            .generate_embedding("what is cardinal cosine similarity")
            .await
            .unwrap();
        let c = svc
            .generate_embedding("ship routing in the baltic sea")
            .await
            .unwrap();
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
    }

    #[tokio::test]
    #[serial]
    async fn unconfigured_embedder_degrades_to_none() {
        clear_env();
        let embedder = Embedder::new(64);
        assert_eq!(embedder.state(), EmbedderState::Uninitialized);
        assert!(embedder.embed("hello").await.is_none());
        assert_eq!(embedder.state(), EmbedderState::Unavailable);
    }

    #[tokio::test]
    async fn explicit_service_is_ready_immediately() {
        let embedder = Embedder::with_service(Arc::new(HashEmbeddingService::new(32)));
        assert_eq!(embedder.state(), EmbedderState::Ready);
        let v = embedder.embed("hello world").await.unwrap();
        assert_eq!(v.len(), 32);
        let batch = embedder
            .embed_batch(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn cosine_handles_dimension_mismatch() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    }
}
