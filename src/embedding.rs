//! Embedding model abstraction.
//!
//! Defines the [`EmbeddingModel`] trait used by the vector index, the
//! OpenAI-compatible implementation, and vector utilities:
//! - [`cosine_similarity`]: similarity between two embedding vectors
//!
//! Use [`create_embedding_model`] to build the configured implementation.

use anyhow::bail;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::config::ModelConfig;
use crate::error::{GatewayError, Result};
use crate::openai::OpenAiClient;

/// Turns text into vectors.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Embed a batch of texts. Output order matches input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::model("empty embedding response"))
    }
}

// ============ OpenAI Embeddings ============

/// Calls `POST {base_url}/embeddings`.
pub struct OpenAiEmbeddingModel {
    client: OpenAiClient,
    model: String,
    dims: Option<usize>,
}

impl OpenAiEmbeddingModel {
    pub fn new(client: OpenAiClient, model: impl Into<String>, dims: Option<usize>) -> Self {
        Self {
            client,
            model: model.into(),
            dims,
        }
    }
}

#[async_trait]
impl EmbeddingModel for OpenAiEmbeddingModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        if let Some(dims) = self.dims {
            body["dimensions"] = dims.into();
        }

        let response = self.client.post("/embeddings", &body).await?;
        let json: Value = response.json().await?;
        let vectors = parse_embeddings(&json)?;
        if vectors.len() != texts.len() {
            return Err(GatewayError::model(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_embeddings(json: &Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| GatewayError::model("invalid embeddings response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| GatewayError::model("invalid embeddings response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let vector: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vector));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Build the embedding model named by `[model].provider`.
pub fn create_embedding_model(config: &ModelConfig) -> anyhow::Result<Arc<dyn EmbeddingModel>> {
    match config.provider.as_str() {
        "openai" => {
            let client = OpenAiClient::new(config)?;
            Ok(Arc::new(OpenAiEmbeddingModel::new(
                client,
                config.embedding_model.clone(),
                config.dims,
            )))
        }
        other => bail!("Unknown model provider: {}", other),
    }
}

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or
/// zero-norm vectors.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (dot, norm_a, norm_b) = a
        .iter()
        .zip(b)
        .fold((0.0f32, 0.0f32, 0.0f32), |(dot, na, nb), (x, y)| {
            (dot + x * y, na + x * x, nb + y * y)
        });

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_parse_embeddings_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        });
        let vectors = parse_embeddings(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_parse_embeddings_rejects_missing_data() {
        let err = parse_embeddings(&serde_json::json!({ "object": "list" })).unwrap_err();
        assert_eq!(err.code(), "model_provider_error");
    }
}
