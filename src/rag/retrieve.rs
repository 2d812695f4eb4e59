//! Vector-store retrieval.

use async_trait::async_trait;
use std::sync::Arc;

use crate::embedding::EmbeddingModel;
use crate::error::{GatewayError, Result};
use crate::filter::FilterExpr;
use crate::models::Document;
use crate::vector_store::{SearchRequest, VectorIndex};

#[async_trait]
pub trait DocumentRetriever: Send + Sync {
    /// Documents relevant to `query`, best first.
    async fn retrieve(&self, query: &str, filter: Option<&FilterExpr>) -> Result<Vec<Document>>;
}

/// Embeds the query and runs a similarity search.
///
/// `top_k` and `similarity_threshold` are fixed at construction; only the
/// filter varies per request. Results are re-checked against both bounds
/// so an index that over-returns cannot leak past them.
pub struct VectorStoreRetriever {
    embedder: Arc<dyn EmbeddingModel>,
    index: Arc<dyn VectorIndex>,
    top_k: usize,
    similarity_threshold: f64,
}

impl VectorStoreRetriever {
    pub fn new(
        embedder: Arc<dyn EmbeddingModel>,
        index: Arc<dyn VectorIndex>,
        top_k: usize,
        similarity_threshold: f64,
    ) -> Self {
        Self {
            embedder,
            index,
            top_k,
            similarity_threshold,
        }
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn similarity_threshold(&self) -> f64 {
        self.similarity_threshold
    }
}

#[async_trait]
impl DocumentRetriever for VectorStoreRetriever {
    async fn retrieve(&self, query: &str, filter: Option<&FilterExpr>) -> Result<Vec<Document>> {
        let query_vector = self
            .embedder
            .embed(query)
            .await
            .map_err(|e| GatewayError::Retrieval(format!("query embedding failed: {}", e)))?;

        let request = SearchRequest {
            query_vector,
            top_k: self.top_k,
            threshold: self.similarity_threshold,
            filter: filter.cloned(),
        };
        let mut docs = self.index.similarity_search(&request).await?;

        docs.retain(|d| d.score.unwrap_or(f64::MIN) >= self.similarity_threshold);
        sort_by_score(&mut docs);
        docs.truncate(self.top_k);
        Ok(docs)
    }
}

/// Stable sort, best score first.
pub(crate) fn sort_by_score(docs: &mut [Document]) {
    docs.sort_by(|a, b| {
        b.score
            .unwrap_or(f64::MIN)
            .partial_cmp(&a.score.unwrap_or(f64::MIN))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}
