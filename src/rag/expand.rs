//! Multi-query expansion.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::llm::ChatModel;
use crate::models::{ChatOptions, ChatRequest, Message};

/// Turns one query into several related queries.
#[async_trait]
pub trait QueryExpander: Send + Sync {
    async fn expand(&self, query: &str) -> Result<Vec<String>>;
}

/// Asks the model for `number_of_queries` paraphrases of the query.
///
/// If the reply does not contain exactly that many variants the expansion
/// is discarded and only the original query is returned.
pub struct MultiQueryExpander {
    model: Arc<dyn ChatModel>,
    number_of_queries: usize,
    include_original: bool,
}

impl MultiQueryExpander {
    pub fn new(model: Arc<dyn ChatModel>, number_of_queries: usize, include_original: bool) -> Self {
        Self {
            model,
            number_of_queries: number_of_queries.max(1),
            include_original,
        }
    }

    fn prompt(&self, query: &str) -> String {
        format!(
            "You are an expert at information retrieval and search optimization.\n\
             Your task is to generate {n} different versions of the given query.\n\n\
             Each variant must cover different perspectives or aspects of the topic,\n\
             while maintaining the core intent of the original query. The goal is to\n\
             expand the search space and improve the chances of finding relevant information.\n\n\
             Do not explain your choices or add any other text.\n\
             Provide the query variants separated by newlines.\n\n\
             Original query: {query}\n\n\
             Query variants:",
            n = self.number_of_queries,
            query = query
        )
    }
}

#[async_trait]
impl QueryExpander for MultiQueryExpander {
    async fn expand(&self, query: &str) -> Result<Vec<String>> {
        let request = ChatRequest {
            messages: vec![Message::user(self.prompt(query))],
            options: ChatOptions {
                temperature: Some(0.0),
                ..Default::default()
            },
            ..Default::default()
        };
        let response = self.model.generate(&request).await?;

        let variants: Vec<String> = response
            .content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        if variants.len() != self.number_of_queries {
            tracing::debug!(
                expected = self.number_of_queries,
                got = variants.len(),
                "query expansion returned an unexpected number of variants"
            );
            return Ok(vec![query.to_string()]);
        }

        let mut queries = Vec::with_capacity(variants.len() + 1);
        if self.include_original {
            queries.push(query.to_string());
        }
        queries.extend(variants);
        Ok(queries)
    }
}
