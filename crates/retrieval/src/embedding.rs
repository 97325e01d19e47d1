//! Embedding client seam.
//!
//! The indexers depend on the [`Embedder`] trait; production wires in
//! [`HttpEmbedder`] (an OpenAI-compatible `/embeddings` endpoint), tests and
//! the `disabled` provider use [`NoopEmbedder`]. Embedding failures are
//! recoverable everywhere: the caller records the error string and keeps
//! empty vectors.

use async_trait::async_trait;
use serde_json::{json, Value};

use warren_domain::config::SecretConfig;
use warren_domain::{Error, Result};

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
    fn provider(&self) -> &str;
    fn model(&self) -> &str;
}

/// Cosine similarity; zero when either vector is empty, mismatched, or
/// degenerate.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP implementation (OpenAI-compatible)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpEmbedder {
    pub fn new(secrets: &SecretConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(20))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            client,
            base_url: secrets.embedding_base_url.trim_end_matches('/').to_string(),
            api_key: secrets.embedding_api_key.clone(),
            model: secrets.embedding_model.clone(),
        })
    }

    fn to_vector(raw: &Value) -> Vec<f32> {
        raw.as_array()
            .map(|items| {
                items
                    .iter()
                    .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if self.api_key.is_empty() {
            return Err(Error::Config(
                "embedding API key is required for the openai provider".into(),
            ));
        }

        let url = format!("{}/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({"model": self.model, "input": texts}))
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Http(format!(
                "embedding endpoint returned {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        let mut rows: Vec<(usize, Vec<f32>)> = body
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::Http("invalid embeddings response format".into()))?
            .iter()
            .map(|row| {
                let index = row.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                let vector = Self::to_vector(row.get("embedding").unwrap_or(&Value::Null));
                (index, vector)
            })
            .collect();
        rows.sort_by_key(|(index, _)| *index);

        let vectors: Vec<Vec<f32>> = rows.into_iter().map(|(_, v)| v).collect();
        if vectors.len() != texts.len() {
            return Err(Error::Http("embedding response size mismatch".into()));
        }
        Ok(vectors)
    }

    fn provider(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Disabled provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Embedder for the `disabled` provider: always errors, which the indexers
/// absorb by indexing with empty vectors (lexical-only retrieval).
#[derive(Default)]
pub struct NoopEmbedder;

#[async_trait]
impl Embedder for NoopEmbedder {
    async fn embed_texts(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(Error::Config("embedding provider is disabled".into()))
    }

    fn provider(&self) -> &str {
        "disabled"
    }

    fn model(&self) -> &str {
        ""
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.5f32, 0.5, 0.5];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn cosine_tolerates_empty_and_mismatched() {
        assert_eq!(cosine_similarity(&[], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[0.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn noop_embedder_reports_disabled() {
        let embedder = NoopEmbedder;
        assert!(embedder.embed_texts(&["x".into()]).await.is_err());
        assert_eq!(embedder.provider(), "disabled");
    }
}
