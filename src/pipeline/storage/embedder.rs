use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::StorageError;
use super::types::EmbeddingModel;

/// Default embedding dimension (matches all-MiniLM-L6-v2).
pub const EMBEDDING_DIM: usize = 384;

// ═══════════════════════════════════════════════════════════
// Hashing embedder
// ═══════════════════════════════════════════════════════════

/// Local, dependency-free embedder: signed feature hashing of lowercase
/// word unigrams and bigrams, L2-normalized. Deterministic across runs.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new() -> Self {
        Self::with_dimension(EMBEDDING_DIM)
    }

    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dimension];
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 1)
            .map(str::to_lowercase)
            .collect();

        let mut add = |feature: &str, weight: f32| {
            let h = fnv1a(feature.as_bytes());
            let slot = (h % self.dimension as u64) as usize;
            let sign = if (h >> 63) & 1 == 1 { -1.0 } else { 1.0 };
            vec[slot] += sign * weight;
        };
        for t in &tokens {
            add(t, 1.0);
        }
        for pair in tokens.windows(2) {
            add(&format!("{} {}", pair[0], pair[1]), 0.5);
        }

        l2_normalize(&mut vec);
        vec
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingModel for HashingEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, StorageError> {
        Ok(self.vectorize(text))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, StorageError> {
        Ok(texts.iter().map(|t| self.vectorize(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn l2_normalize(vec: &mut [f32]) {
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for val in vec.iter_mut() {
            *val /= norm;
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Ollama embedder
// ═══════════════════════════════════════════════════════════

#[derive(Serialize)]
struct OllamaEmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

/// Embeddings from a local Ollama instance (`/api/embeddings`). Only
/// scrubbed text is ever sent.
pub struct OllamaEmbedder {
    base_url: String,
    model: String,
    dimension: usize,
    client: reqwest::blocking::Client,
}

impl OllamaEmbedder {
    pub fn new(base_url: &str, model: &str, dimension: usize, timeout_secs: u64) -> Result<Self, StorageError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| StorageError::Embedding(format!("HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            dimension,
            client,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl EmbeddingModel for OllamaEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, StorageError> {
        let url = format!("{}/api/embeddings", self.base_url);
        let body = OllamaEmbeddingRequest {
            model: &self.model,
            prompt: text,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| StorageError::Embedding(if e.is_connect() {
                "cannot reach Ollama".to_string()
            } else {
                e.to_string()
            }))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::Embedding(format!("Ollama returned status {}", status.as_u16())));
        }

        let parsed: OllamaEmbeddingResponse = response
            .json()
            .map_err(|e| StorageError::Embedding(format!("Response parsing: {e}")))?;

        if parsed.embedding.len() != self.dimension {
            return Err(StorageError::DimensionMismatch {
                expected: self.dimension,
                actual: parsed.embedding.len(),
            });
        }
        let mut vec = parsed.embedding;
        l2_normalize(&mut vec);
        Ok(vec)
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, StorageError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
