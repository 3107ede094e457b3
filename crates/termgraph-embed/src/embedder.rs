//! Embedding backends.
//!
//! - Deterministic token-hash embeddings (no model, always available).
//! - Model embeddings over HTTP (Ollama-style `/api/embed`).

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::EmbeddingFailure;

/// Maps batches of input text to fixed-length vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifies the vectors this embedder produces; part of the vector key.
    fn model_version(&self) -> &str;

    fn dimension(&self) -> usize;

    /// One vector per input text, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingFailure>;
}

pub(crate) fn normalize_in_place(v: &mut [f32]) {
    let norm2: f32 = v.iter().map(|x| x * x).sum();
    if norm2 <= 0.0 {
        return;
    }
    let inv = 1.0f32 / norm2.sqrt();
    for x in v.iter_mut() {
        *x *= inv;
    }
}

// ============================================================================
// Token hash
// ============================================================================

fn fnv1a64(s: &str) -> u64 {
    let mut h: u64 = 14695981039346656037;
    for b in s.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(1099511628211);
    }
    h
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

/// Signed feature hashing of lowercase word tokens, L2-normalized.
#[derive(Debug, Clone)]
pub struct TokenHashEmbedder {
    model_version: String,
    dimension: usize,
}

impl TokenHashEmbedder {
    pub const DEFAULT_DIMENSION: usize = 128;

    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            model_version: format!("token-hash-{dimension}"),
            dimension,
        }
    }

    /// Record vectors under `version` instead of `token-hash-<dimension>`.
    pub fn with_model_version(mut self, version: &str) -> Self {
        self.model_version = version.to_string();
        self
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        for token in tokenize(text) {
            let h = fnv1a64(&token);
            let idx = (h % self.dimension as u64) as usize;
            let sign = if (h >> 32) & 1 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        normalize_in_place(&mut v);
        v
    }
}

impl Default for TokenHashEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMENSION)
    }
}

#[async_trait]
impl Embedder for TokenHashEmbedder {
    fn model_version(&self) -> &str {
        &self.model_version
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingFailure> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

// ============================================================================
// HTTP model
// ============================================================================

/// Model embeddings from an HTTP endpoint accepting
/// `{"model", "input": [..]}` and answering `{"embeddings": [[..], ..]}`.
#[derive(Debug, Clone)]
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    model_version: String,
    dimension: usize,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl HttpEmbedder {
    pub fn new(
        base_url: &str,
        model: &str,
        dimension: usize,
        timeout: Option<Duration>,
    ) -> Result<Self, EmbeddingFailure> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|e| EmbeddingFailure::Backend {
            model_version: model.to_string(),
            reason: format!("failed to build http client: {e}"),
        })?;
        let base = base_url.trim_end_matches('/');
        Ok(Self {
            client,
            endpoint: format!("{base}/api/embed"),
            model: model.to_string(),
            model_version: model.to_string(),
            dimension,
        })
    }

    /// Override the version recorded with stored vectors (defaults to the
    /// model name).
    pub fn with_model_version(mut self, version: &str) -> Self {
        self.model_version = version.to_string();
        self
    }

    fn failure(&self, reason: String) -> EmbeddingFailure {
        EmbeddingFailure::Backend {
            model_version: self.model_version.clone(),
            reason,
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_version(&self) -> &str {
        &self.model_version
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingFailure> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
            "truncate": true
        });
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.failure(format!("failed to reach {}: {e}", self.endpoint)))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(self.failure(format!("http error {status}: {text}")));
        }
        let out: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| self.failure(format!("invalid JSON response: {e}")))?;
        if out.embeddings.len() != texts.len() {
            return Err(EmbeddingFailure::Count {
                expected: texts.len(),
                actual: out.embeddings.len(),
            });
        }
        Ok(out.embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn token_hash_is_deterministic_and_unit_length() {
        let e = TokenHashEmbedder::new(64);
        let a = e.embed_text("Breast carcinoma (Breast cancer)");
        let b = e.embed_text("Breast carcinoma (Breast cancer)");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_relative_eq!(dot(&a, &a), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn token_hash_ignores_case_and_punctuation() {
        let e = TokenHashEmbedder::default();
        let a = e.embed_text("BRCA1 DNA repair associated");
        let b = e.embed_text("brca1, dna; repair-associated");
        assert_relative_eq!(dot(&a, &b), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn empty_text_embeds_to_zero() {
        let e = TokenHashEmbedder::new(8);
        assert!(e.embed_text("  --  ").iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn batch_preserves_order() {
        let e = TokenHashEmbedder::new(32);
        let texts = vec!["alpha".to_string(), "beta".to_string()];
        let out = e.embed_batch(&texts).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], e.embed_text("alpha"));
        assert_eq!(out[1], e.embed_text("beta"));
        assert_eq!(e.model_version(), "token-hash-32");
    }

    #[tokio::test]
    async fn unreachable_http_backend_is_an_embedding_failure() {
        let e = HttpEmbedder::new("http://127.0.0.1:9", "nomic-embed-text", 768, Some(Duration::from_millis(200)))
            .unwrap()
            .with_model_version("nomic-v1.5");
        let err = e.embed_batch(&["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, EmbeddingFailure::Backend { ref model_version, .. } if model_version == "nomic-v1.5"));
    }
}
