//! In-memory [`VectorIndex`] implementation.
//!
//! Entries live in a `Vec` behind `std::sync::RwLock`. Search is
//! brute-force cosine similarity over every stored vector, which is plenty
//! for the document volumes a single gateway ingests at startup.
//!
//! The index can be persisted to and restored from a JSON file so a
//! restart does not require re-ingesting.

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::embedding::{cosine_similarity, EmbeddingModel};
use crate::error::{GatewayError, Result};
use crate::models::Document;

use super::{SearchRequest, VectorIndex};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    document: Document,
    vector: Vec<f32>,
}

pub struct InMemoryVectorIndex {
    embedder: Arc<dyn EmbeddingModel>,
    batch_size: usize,
    entries: RwLock<Vec<StoredEntry>>,
}

impl InMemoryVectorIndex {
    pub fn new(embedder: Arc<dyn EmbeddingModel>, batch_size: usize) -> Self {
        Self {
            embedder,
            batch_size: batch_size.max(1),
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Write every entry to `path` as JSON.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let entries = self
            .entries
            .read()
            .map_err(|_| anyhow::anyhow!("vector index lock poisoned"))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_vec(&*entries)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write vector index: {}", path.display()))?;
        tracing::info!(path = %path.display(), entries = entries.len(), "saved vector index");
        Ok(())
    }

    /// Replace the contents of the index with the entries stored at `path`.
    ///
    /// Returns the number of loaded entries; a missing file loads nothing.
    pub fn load(&self, path: &Path) -> anyhow::Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let raw = std::fs::read(path)
            .with_context(|| format!("Failed to read vector index: {}", path.display()))?;
        let loaded: Vec<StoredEntry> = serde_json::from_slice(&raw)
            .with_context(|| format!("Failed to parse vector index: {}", path.display()))?;
        let count = loaded.len();
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow::anyhow!("vector index lock poisoned"))?;
        *entries = loaded;
        tracing::info!(path = %path.display(), entries = count, "loaded vector index");
        Ok(count)
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn write(&self, documents: &[Document]) -> Result<usize> {
        if documents.is_empty() {
            return Ok(0);
        }

        // Embed everything before taking the lock so a failure leaves the
        // index untouched.
        let mut vectors = Vec::with_capacity(documents.len());
        for batch in documents.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|d| d.text.clone()).collect();
            let embedded = self
                .embedder
                .embed_batch(&texts)
                .await
                .map_err(|e| GatewayError::IndexWrite(format!("embedding failed: {}", e)))?;
            if embedded.len() != batch.len() {
                return Err(GatewayError::IndexWrite(format!(
                    "embedding model returned {} vectors for {} documents",
                    embedded.len(),
                    batch.len()
                )));
            }
            vectors.extend(embedded);
        }

        let mut entries = self
            .entries
            .write()
            .map_err(|_| GatewayError::IndexWrite("vector index lock poisoned".to_string()))?;
        let mut positions: HashMap<String, usize> = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.document.id.clone(), i))
            .collect();

        for (doc, vector) in documents.iter().zip(vectors) {
            let mut document = doc.clone();
            document.score = None;
            let entry = StoredEntry { document, vector };
            match positions.get(&doc.id) {
                Some(&i) => entries[i] = entry,
                None => {
                    positions.insert(doc.id.clone(), entries.len());
                    entries.push(entry);
                }
            }
        }

        tracing::debug!(written = documents.len(), total = entries.len(), "vector index write");
        Ok(documents.len())
    }

    async fn similarity_search(&self, request: &SearchRequest) -> Result<Vec<Document>> {
        if request.top_k == 0 {
            return Ok(Vec::new());
        }
        let entries = self
            .entries
            .read()
            .map_err(|_| GatewayError::Retrieval("vector index lock poisoned".to_string()))?;

        let mut hits: Vec<Document> = entries
            .iter()
            .filter(|e| {
                request
                    .filter
                    .as_ref()
                    .map(|f| f.matches(&e.document.metadata))
                    .unwrap_or(true)
            })
            .filter_map(|e| {
                let score = cosine_similarity(&request.query_vector, &e.vector) as f64;
                (score >= request.threshold).then(|| {
                    let mut doc = e.document.clone();
                    doc.score = Some(score);
                    doc
                })
            })
            .collect();

        // sort_by is stable: equal scores keep insertion order.
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(request.top_k);
        Ok(hits)
    }

    fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }
}
