//! Query-time retrieval pipeline.
//!
//! [`RetrievalOrchestrator`] runs one query through a fixed sequence of
//! stages:
//!
//! ```text
//! Received ─▶ Expanded ─▶ Transformed ─▶ Retrieved ─▶ PostProcessed ─▶ Augmented
//! ```
//!
//! The `Dispatched` state is reached by the caller once the augmented
//! prompt is sent to the model. Every component except the retriever is
//! optional and an absent one leaves its input unchanged.
//!
//! Expansion and translation failures degrade to the unmodified query with
//! a warning. Retrieval and augmentation failures abort the request.

pub mod augment;
pub mod expand;
pub mod postprocess;
pub mod retrieve;
pub mod transform;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::filter::FilterExpr;
use crate::models::{Document, Grounding};

pub use augment::{AugmentedQuery, ContextualQueryAugmenter};
pub use expand::{MultiQueryExpander, QueryExpander};
pub use postprocess::{DocumentPostProcessor, SearchResultPrinter};
pub use retrieve::{DocumentRetriever, VectorStoreRetriever};
pub use transform::{QueryTransformer, TranslationQueryTransformer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalStage {
    Received,
    Expanded,
    Transformed,
    Retrieved,
    PostProcessed,
    Augmented,
    Dispatched,
}

impl fmt::Display for RetrievalStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RetrievalStage::Received => "received",
            RetrievalStage::Expanded => "expanded",
            RetrievalStage::Transformed => "transformed",
            RetrievalStage::Retrieved => "retrieved",
            RetrievalStage::PostProcessed => "post_processed",
            RetrievalStage::Augmented => "augmented",
            RetrievalStage::Dispatched => "dispatched",
        };
        f.write_str(name)
    }
}

/// Result of running a query through the pipeline.
#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    /// Queries actually sent to the retriever.
    pub queries: Vec<String>,
    pub documents: Vec<Document>,
    pub prompt: String,
    pub grounding: Grounding,
}

pub struct RetrievalOrchestrator {
    expander: Option<Arc<dyn QueryExpander>>,
    transformer: Option<Arc<dyn QueryTransformer>>,
    retriever: Arc<dyn DocumentRetriever>,
    post_processor: Option<Arc<dyn DocumentPostProcessor>>,
    augmenter: ContextualQueryAugmenter,
    top_k: usize,
}

impl RetrievalOrchestrator {
    pub fn new(retriever: Arc<dyn DocumentRetriever>, augmenter: ContextualQueryAugmenter, top_k: usize) -> Self {
        Self {
            expander: None,
            transformer: None,
            retriever,
            post_processor: None,
            augmenter,
            top_k,
        }
    }

    pub fn with_expander(mut self, expander: Arc<dyn QueryExpander>) -> Self {
        self.expander = Some(expander);
        self
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn QueryTransformer>) -> Self {
        self.transformer = Some(transformer);
        self
    }

    pub fn with_post_processor(mut self, post_processor: Arc<dyn DocumentPostProcessor>) -> Self {
        self.post_processor = Some(post_processor);
        self
    }

    /// Run `query` through every stage up to `Augmented`.
    ///
    /// A malformed `filter_expression` fails before any model call is made.
    pub async fn run(&self, query: &str, filter_expression: Option<&str>) -> Result<RetrievalOutcome> {
        let filter = match filter_expression.map(str::trim).filter(|f| !f.is_empty()) {
            Some(expr) => Some(FilterExpr::parse(expr)?),
            None => None,
        };
        log_stage(RetrievalStage::Received, 1);

        let queries = match &self.expander {
            Some(expander) => match expander.expand(query).await {
                Ok(queries) if !queries.is_empty() => queries,
                Ok(_) => vec![query.to_string()],
                Err(e) => {
                    tracing::warn!(error = %e, "query expansion failed, using original query");
                    vec![query.to_string()]
                }
            },
            None => vec![query.to_string()],
        };
        log_stage(RetrievalStage::Expanded, queries.len());

        let queries = match &self.transformer {
            Some(transformer) => {
                let transformed = futures::future::join_all(queries.iter().map(|q| transformer.transform(q))).await;
                queries
                    .into_iter()
                    .zip(transformed)
                    .map(|(original, result)| match result {
                        Ok(q) => q,
                        Err(e) => {
                            tracing::warn!(error = %e, "query transformation failed, using query as-is");
                            original
                        }
                    })
                    .collect()
            }
            None => queries,
        };
        log_stage(RetrievalStage::Transformed, queries.len());

        let results = futures::future::try_join_all(
            queries
                .iter()
                .map(|q| self.retriever.retrieve(q, filter.as_ref())),
        )
        .await?;
        let documents = merge_results(results, self.top_k);
        log_stage(RetrievalStage::Retrieved, documents.len());

        let documents = match &self.post_processor {
            Some(processor) => processor.process(query, documents),
            None => documents,
        };
        log_stage(RetrievalStage::PostProcessed, documents.len());

        let augmented = self.augmenter.augment(query, &documents)?;
        log_stage(RetrievalStage::Augmented, documents.len());

        Ok(RetrievalOutcome {
            queries,
            documents,
            prompt: augmented.text,
            grounding: augmented.grounding,
        })
    }
}

fn log_stage(stage: RetrievalStage, items: usize) {
    tracing::debug!(stage = %stage, items, "retrieval stage");
}

/// Merge per-query results: deduplicate by id keeping the best score at the
/// first position seen, then order by score and keep `top_k`.
pub fn merge_results(results: Vec<Vec<Document>>, top_k: usize) -> Vec<Document> {
    let mut merged: Vec<Document> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for doc in results.into_iter().flatten() {
        match positions.get(&doc.id) {
            Some(&pos) => {
                if doc.score.unwrap_or(f64::MIN) > merged[pos].score.unwrap_or(f64::MIN) {
                    merged[pos].score = doc.score;
                }
            }
            None => {
                positions.insert(doc.id.clone(), merged.len());
                merged.push(doc);
            }
        }
    }

    retrieve::sort_by_score(&mut merged);
    merged.truncate(top_k);
    merged
}
