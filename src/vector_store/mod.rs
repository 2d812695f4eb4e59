//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait is the only contract the ingestion and
//! retrieval pipelines need from a vector store: batch writes and
//! similarity search with threshold, top-k, and an optional metadata filter.
//! The search algorithm behind it is up to the implementation.
//!
//! Implementations must be `Send + Sync`; the index is shared by every
//! request.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::filter::FilterExpr;
use crate::models::Document;

pub use memory::InMemoryVectorIndex;

/// Parameters of one similarity search.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query_vector: Vec<f32>,
    pub top_k: usize,
    /// Minimum similarity score, inclusive.
    pub threshold: f64,
    pub filter: Option<FilterExpr>,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Embed and store `documents`. Either every document is stored or none is.
    ///
    /// Documents whose id is already present replace the stored copy.
    async fn write(&self, documents: &[Document]) -> Result<usize>;

    /// Documents scoring at least `threshold`, best first, at most `top_k`.
    ///
    /// Every returned document has `score` set. Equal scores keep the
    /// order in which the documents were written.
    async fn similarity_search(&self, request: &SearchRequest) -> Result<Vec<Document>>;

    /// Number of stored documents.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
