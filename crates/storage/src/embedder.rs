use async_trait::async_trait;
use bastion_core::config::EmbedderConfig;
use bastion_core::MemoryError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

/// Turns text into a fixed-size vector. Opaque to the memory store.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError>;
}

/// Cosine similarity. Zero vectors and length mismatches score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    let sim = dot / (na.sqrt() * nb.sqrt());
    if sim.is_finite() {
        sim
    } else {
        0.0
    }
}

/// Deterministic feature-hashing embedder: unigrams and bigrams of the
/// lowercased alphanumeric tokens, signed-hashed into `dims` buckets and
/// L2-normalized. Needs no network and gives stable vectors across runs.
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    fn tokens(text: &str) -> Vec<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect()
    }

    fn add_feature(&self, vec: &mut [f32], feature: &str) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut idx_bytes = [0u8; 8];
        idx_bytes.copy_from_slice(&digest[..8]);
        let idx = (u64::from_le_bytes(idx_bytes) % self.dims as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vec[idx] += sign;
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dims];
        let tokens = Self::tokens(text);
        for token in &tokens {
            self.add_feature(&mut vec, token);
        }
        for pair in tokens.windows(2) {
            self.add_feature(&mut vec, &format!("{} {}", pair[0], pair[1]));
        }
        let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vec {
                *v /= norm;
            }
        }
        vec
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        Ok(self.embed_sync(text))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenAIEmbedderParams {
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default = "default_key_env")]
    api_key_env: String,
    #[serde(default = "default_embed_base")]
    api_base: String,
    #[serde(default = "default_embed_model")]
    model: String,
    #[serde(default = "default_embed_timeout")]
    timeout_secs: u64,
}

fn default_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_embed_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_embed_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embed_timeout() -> u64 {
    30
}

/// `/embeddings` endpoint of OpenAI or a compatible server.
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
    model: String,
    dims: usize,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
    dimensions: usize,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl OpenAIEmbedder {
    pub fn from_params(params: &serde_json::Value, dims: usize) -> anyhow::Result<Self> {
        let p: OpenAIEmbedderParams = if params.is_null() {
            serde_json::from_value(serde_json::json!({}))?
        } else {
            serde_json::from_value(params.clone())?
        };
        let api_key = match p.api_key.filter(|k| !k.is_empty()) {
            Some(k) => k,
            None => std::env::var(&p.api_key_env)
                .map_err(|_| anyhow::anyhow!("environment variable {} is not set", p.api_key_env))?,
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(p.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            api_key,
            api_base: p.api_base.trim_end_matches('/').to_string(),
            model: p.model,
            dims,
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn name(&self) -> &str {
        "openai"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        let req = EmbeddingRequest {
            model: &self.model,
            input: text,
            dimensions: self.dims,
        };
        let resp = self
            .client
            .post(format!("{}/embeddings", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| MemoryError::BackendUnavailable(format!("embedding request failed: {}", e)))?
            .json::<EmbeddingResponse>()
            .await
            .map_err(|e| MemoryError::BackendUnavailable(format!("bad embedding response: {}", e)))?;

        let embedding = resp
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| MemoryError::BackendUnavailable("empty embedding response".to_string()))?;
        if embedding.len() != self.dims {
            return Err(MemoryError::BackendUnavailable(format!(
                "embedding has {} dimensions, expected {}",
                embedding.len(),
                self.dims
            )));
        }
        Ok(embedding)
    }
}

/// Build the embedder named by the memory config.
pub fn build_embedder(cfg: &EmbedderConfig) -> anyhow::Result<Arc<dyn Embedder>> {
    match cfg.kind.as_str() {
        "hashing" => Ok(Arc::new(HashingEmbedder::new(cfg.dimensions))),
        "openai" => Ok(Arc::new(OpenAIEmbedder::from_params(&cfg.params, cfg.dimensions)?)),
        other => anyhow::bail!("unknown embedder '{}'", other),
    }
}
