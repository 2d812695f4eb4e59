//! Document ingestion pipeline.
//!
//! Runs the ETL stages in batch order: every stage finishes for all
//! sources before the next one starts.
//!
//! ```text
//! sources ─▶ extract all ─▶ chunk all ─▶ enrich all ─▶ write to every sink
//! ```
//!
//! Any stage failing aborts the run. The vector index write is
//! all-or-nothing, so a failed run leaves no partial batch in the index.
//! The pipeline does not deduplicate across runs: re-ingesting the same
//! sources adds a second set of chunks.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

use crate::chunk::TextSplitter;
use crate::enrich::KeywordEnricher;
use crate::error::{GatewayError, Result};
use crate::models::Document;
use crate::reader::Extractor;
use crate::vector_store::VectorIndex;

/// Destination for an ingested batch.
#[async_trait]
pub trait DocumentWriter: Send + Sync {
    fn name(&self) -> &str;

    /// Write the whole batch; returns the number of documents written.
    async fn write(&self, documents: &[Document]) -> Result<usize>;
}

/// Writes batches into a [`VectorIndex`].
pub struct VectorIndexWriter {
    index: Arc<dyn VectorIndex>,
}

impl VectorIndexWriter {
    pub fn new(index: Arc<dyn VectorIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl DocumentWriter for VectorIndexWriter {
    fn name(&self) -> &str {
        "vector-index"
    }

    async fn write(&self, documents: &[Document]) -> Result<usize> {
        self.index.write(documents).await
    }
}

/// Debug sink: logs the batch as pretty-printed JSON.
pub struct JsonLogWriter;

#[async_trait]
impl DocumentWriter for JsonLogWriter {
    fn name(&self) -> &str {
        "json-log"
    }

    async fn write(&self, documents: &[Document]) -> Result<usize> {
        let json = serde_json::to_string_pretty(documents)
            .map_err(|e| GatewayError::IndexWrite(e.to_string()))?;
        tracing::info!(target: "rag_gateway::ingest::batch", documents = documents.len(), "{}", json);
        Ok(documents.len())
    }
}

/// Counts from one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub sources: usize,
    pub documents: usize,
    pub chunks: usize,
    /// Chunks written to each sink, in sink order.
    pub written: Vec<(String, usize)>,
    pub dry_run: bool,
}

impl IngestReport {
    pub fn print(&self) {
        if self.dry_run {
            println!("ingest (dry-run)");
        } else {
            println!("ingest");
        }
        println!("  sources: {}", self.sources);
        println!("  documents extracted: {}", self.documents);
        println!("  chunks: {}", self.chunks);
        for (sink, count) in &self.written {
            println!("  written to {}: {}", sink, count);
        }
        println!("ok");
    }
}

pub struct IngestionPipeline {
    extractor: Arc<dyn Extractor>,
    splitter: TextSplitter,
    enricher: Option<KeywordEnricher>,
    writers: Vec<Arc<dyn DocumentWriter>>,
}

impl IngestionPipeline {
    pub fn new(extractor: Arc<dyn Extractor>, splitter: TextSplitter) -> Self {
        Self {
            extractor,
            splitter,
            enricher: None,
            writers: Vec::new(),
        }
    }

    pub fn with_enricher(mut self, enricher: KeywordEnricher) -> Self {
        self.enricher = Some(enricher);
        self
    }

    /// Add a sink. Sinks are written in registration order.
    pub fn with_writer(mut self, writer: Arc<dyn DocumentWriter>) -> Self {
        self.writers.push(writer);
        self
    }

    /// Extract and chunk only; nothing is enriched or written.
    pub async fn dry_run(&self, sources: &[PathBuf]) -> Result<IngestReport> {
        let documents = self.extract_all(sources).await?;
        let chunks = self.splitter.apply(&documents);
        Ok(IngestReport {
            sources: sources.len(),
            documents: documents.len(),
            chunks: chunks.len(),
            written: Vec::new(),
            dry_run: true,
        })
    }

    pub async fn run(&self, sources: &[PathBuf]) -> Result<IngestReport> {
        let documents = self.extract_all(sources).await?;
        tracing::info!(sources = sources.len(), documents = documents.len(), "extracted");

        let mut chunks = self.splitter.apply(&documents);
        tracing::info!(chunks = chunks.len(), "chunked");

        if let Some(enricher) = &self.enricher {
            chunks = enricher.enrich(chunks).await?;
            tracing::info!(chunks = chunks.len(), "enriched");
        }

        let mut written = Vec::with_capacity(self.writers.len());
        for writer in &self.writers {
            let count = writer.write(&chunks).await?;
            tracing::info!(sink = writer.name(), written = count, "batch written");
            written.push((writer.name().to_string(), count));
        }

        Ok(IngestReport {
            sources: sources.len(),
            documents: documents.len(),
            chunks: chunks.len(),
            written,
            dry_run: false,
        })
    }

    async fn extract_all(&self, sources: &[PathBuf]) -> Result<Vec<Document>> {
        let extractor = self.extractor.clone();
        let sources = sources.to_vec();
        tokio::task::spawn_blocking(move || -> Result<Vec<Document>> {
            let mut documents = Vec::new();
            for source in &sources {
                documents.extend(extractor.read(source)?);
            }
            Ok(documents)
        })
        .await
        .map_err(|e| GatewayError::Extraction {
            location: "<ingest>".to_string(),
            message: e.to_string(),
        })?
    }
}
