//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]** — returns errors; used when embeddings are not configured.
//! - **[`HashProvider`]** — deterministic token-hash vectors; dependency-free
//!   fallback for tests and smoke runs, not a real semantic model.
//! - **[`OllamaProvider`]** — calls a local Ollama instance's `/api/embed` endpoint
//!   with retry and backoff.
//! - **`LocalProvider`** — runs models in-process via fastembed (behind the
//!   `local-embeddings-fastembed` feature); no network calls after model download.
//!
//! Also provides [`cosine_similarity`] for comparing embedding vectors and
//! [`embed_with_timeout`], the entry point the store uses so a hung model
//! call surfaces as [`KbError::EmbeddingTimeout`] rather than stalling
//! ingestion.
//!
//! # Retry Strategy
//!
//! The Ollama provider uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::config::EmbeddingConfig;
use crate::error::{KbError, Result};

/// Trait for embedding providers.
///
/// A provider wraps one fixed-dimension text→vector model. Implementations
/// must be callable from a worker context without blocking a foreground
/// task; heavy inference belongs on `spawn_blocking`.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier (e.g. `"all-minilm-l6-v2"`), persisted in the index
    /// file header.
    fn model_name(&self) -> &str;

    /// Embedding vector dimensionality (e.g. `384`).
    fn dims(&self) -> usize;

    /// Whether the model has finished initializing. `embed` fails with
    /// [`KbError::ModelNotReady`] while this is false.
    fn is_ready(&self) -> bool;

    /// Perform any one-time model loading. Idempotent.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Turn text into a vector of length [`dims`](Self::dims).
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Embed one text, bounding the call with a timeout.
///
/// Returns [`KbError::EmbeddingTimeout`] when the deadline passes; the
/// in-flight model call is dropped. [`KbError::ModelNotReady`] is checked
/// before the call is issued at all.
pub async fn embed_with_timeout(
    provider: &dyn EmbeddingProvider,
    text: &str,
    timeout: Duration,
) -> Result<Vec<f32>> {
    if !provider.is_ready() {
        return Err(KbError::ModelNotReady);
    }
    match tokio::time::timeout(timeout, provider.embed(text)).await {
        Ok(result) => result,
        Err(_) => Err(KbError::EmbeddingTimeout {
            timeout_secs: timeout.as_secs(),
        }),
    }
}

/// Create the appropriate [`EmbeddingProvider`] based on configuration.
///
/// | Config value | Provider |
/// |--------------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"hash"` | [`HashProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
/// | `"local"` | `LocalProvider` (requires `local-embeddings-fastembed`) |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "hash" => Ok(Arc::new(HashProvider::new(config.dims.unwrap_or(64)))),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => Err(KbError::Config(
            "local embedding provider requires --features local-embeddings-fastembed".to_string(),
        )),
        other => Err(KbError::Config(format!(
            "unknown embedding provider: '{}'. Must be disabled, hash, ollama, or local.",
            other
        ))),
    }
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always reports not-ready.
///
/// Used when `embedding.provider = "disabled"` in the configuration. Status
/// queries and `load_index` still work; any attempt to embed fails.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    fn is_ready(&self) -> bool {
        false
    }
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(KbError::ModelNotReady)
    }
}

// ============ Hash Provider ============

/// Deterministic token-hash embeddings.
///
/// Each lowercase alphanumeric token is hashed into a bucket with a sign
/// bit; the resulting count vector is L2-normalized. Cosine similarity then
/// tracks token overlap, which is enough for tests and offline smoke runs.
/// Not a semantic model — real deployments use `ollama` or `local`.
pub struct HashProvider {
    dims: usize,
}

impl HashProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }
}

#[async_trait]
impl EmbeddingProvider for HashProvider {
    fn model_name(&self) -> &str {
        "token-hash"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn is_ready(&self) -> bool {
        true
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vec = vec![0.0f32; self.dims];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.as_bytes());
            let h = u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"));
            let bucket = (h % self.dims as u64) as usize;
            let sign = if h & (1u64 << 63) == 0 { 1.0 } else { -1.0 };
            vec[bucket] += sign;
        }
        let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vec {
                *v /= norm;
            }
        }
        Ok(vec)
    }
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default
/// `http://localhost:11434`). Requires Ollama to be running with an
/// embedding model pulled (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| KbError::Config("embedding.model required for Ollama provider".into()))?;
        let dims = config
            .dims
            .ok_or_else(|| KbError::Config("embedding.dims required for Ollama provider".into()))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            model,
            dims,
            url,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn is_ready(&self) -> bool {
        true
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let client = reqwest::Client::new();
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = client
                .post(format!("{}/api/embed", self.url))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| KbError::EmbeddingFailed(e.to_string()))?;
                        let vec = parse_ollama_response(&json)?;
                        if vec.len() != self.dims {
                            return Err(KbError::EmbeddingFailed(format!(
                                "model '{}' returned {} dims, expected {}",
                                self.model,
                                vec.len(),
                                self.dims
                            )));
                        }
                        return Ok(vec);
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(KbError::EmbeddingFailed(format!(
                            "Ollama API error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    return Err(KbError::EmbeddingFailed(format!(
                        "Ollama API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(KbError::EmbeddingFailed(format!(
                        "Ollama connection error (is Ollama running at {}?): {}",
                        self.url, e
                    )));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| KbError::EmbeddingFailed("embedding failed after retries".into())))
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<f32>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            KbError::EmbeddingFailed("invalid Ollama response: missing embeddings array".into())
        })?;

    let first = embeddings.first().and_then(|e| e.as_array()).ok_or_else(|| {
        KbError::EmbeddingFailed("invalid Ollama response: empty embeddings array".into())
    })?;

    Ok(first
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

// ============ Local Provider (fastembed) ============

/// Embedding provider for in-process inference via fastembed.
///
/// Models are downloaded on first use from Hugging Face and cached; after
/// that, embeddings run entirely offline. Model loading happens in
/// [`initialize`](EmbeddingProvider::initialize) and inference runs on a
/// blocking thread so async callers are never stalled.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalProvider {
    model_name: String,
    dims: usize,
    inner: Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());

        // Make sure the name is resolvable before the store starts using us.
        config_to_fastembed_model(&model_name)?;

        let dims = config.dims.unwrap_or(match model_name.as_str() {
            "all-minilm-l6-v2" => 384,
            "bge-small-en-v1.5" => 384,
            "bge-base-en-v1.5" => 768,
            "bge-large-en-v1.5" => 1024,
            "nomic-embed-text-v1" | "nomic-embed-text-v1.5" => 768,
            "multilingual-e5-small" => 384,
            "multilingual-e5-base" => 768,
            "multilingual-e5-large" => 1024,
            _ => 384,
        });

        Ok(Self {
            model_name,
            dims,
            inner: Arc::new(std::sync::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => Err(KbError::Config(format!(
            "unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1, nomic-embed-text-v1.5, \
             multilingual-e5-small, multilingual-e5-base, multilingual-e5-large",
            other
        ))),
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn is_ready(&self) -> bool {
        self.inner.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    async fn initialize(&self) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }
        let model = config_to_fastembed_model(&self.model_name)?;
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let loaded = fastembed::TextEmbedding::try_new(
                fastembed::InitOptions::new(model).with_show_download_progress(true),
            )
            .map_err(|e| {
                KbError::EmbeddingFailed(format!("failed to initialize local model: {}", e))
            })?;
            let mut guard = inner
                .lock()
                .map_err(|_| KbError::EmbeddingFailed("model lock poisoned".into()))?;
            *guard = Some(loaded);
            Ok(())
        })
        .await
        .map_err(|e| KbError::EmbeddingFailed(e.to_string()))?
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let inner = Arc::clone(&self.inner);
        let text = text.to_string();
        tokio::task::spawn_blocking(move || {
            let mut guard = inner
                .lock()
                .map_err(|_| KbError::EmbeddingFailed("model lock poisoned".into()))?;
            let model = guard.as_mut().ok_or(KbError::ModelNotReady)?;
            let mut out = model
                .embed(vec![text], None)
                .map_err(|e| KbError::EmbeddingFailed(e.to_string()))?;
            out.pop()
                .ok_or_else(|| KbError::EmbeddingFailed("empty embedding response".into()))
        })
        .await
        .map_err(|e| KbError::EmbeddingFailed(e.to_string()))?
    }
}

// ============ Vector math ============

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`:
/// - `1.0` = identical direction
/// - `0.0` = orthogonal (unrelated)
/// - `-1.0` = opposite direction
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
