//! Keyword enrichment.
//!
//! Asks the chat model for a handful of keywords per chunk and stores them
//! in the chunk's `keywords` metadata. Requests run concurrently up to a
//! bound, but the output order always matches the input order. A failed
//! model call fails the whole batch instead of silently dropping a chunk.

use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;

use crate::error::Result;
use crate::llm::ChatModel;
use crate::models::{ChatRequest, Document, Message};

pub const KEYWORDS_KEY: &str = "keywords";

pub struct KeywordEnricher {
    model: Arc<dyn ChatModel>,
    keyword_count: usize,
    concurrency: usize,
}

impl KeywordEnricher {
    pub fn new(model: Arc<dyn ChatModel>, keyword_count: usize, concurrency: usize) -> Self {
        Self {
            model,
            keyword_count: keyword_count.max(1),
            concurrency: concurrency.max(1),
        }
    }

    pub async fn enrich(&self, documents: Vec<Document>) -> Result<Vec<Document>> {
        futures::stream::iter(documents)
            .map(|doc| self.enrich_one(doc))
            .buffered(self.concurrency)
            .try_collect()
            .await
    }

    async fn enrich_one(&self, mut doc: Document) -> Result<Document> {
        let request = ChatRequest {
            messages: vec![Message::user(keyword_prompt(&doc.text, self.keyword_count))],
            ..Default::default()
        };
        let response = self.model.generate(&request).await?;
        let keywords = parse_keywords(&response.content, self.keyword_count);
        doc.metadata
            .insert(KEYWORDS_KEY.to_string(), keywords.join(", ").into());
        Ok(doc)
    }
}

fn keyword_prompt(text: &str, count: usize) -> String {
    format!(
        "{}. Give {} unique keywords for this document. Format as comma separated. Keywords:",
        text, count
    )
}

/// Split a model reply into at most `limit` distinct keywords.
fn parse_keywords(reply: &str, limit: usize) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    for raw in reply.split([',', '\n']) {
        let keyword = raw
            .trim()
            .trim_start_matches(|c: char| c == '-' || c == '*' || c.is_ascii_digit() || c == '.')
            .trim()
            .trim_matches('"');
        if keyword.is_empty() || keywords.iter().any(|k| k.eq_ignore_ascii_case(keyword)) {
            continue;
        }
        keywords.push(keyword.to_string());
        if keywords.len() == limit {
            break;
        }
    }
    keywords
}
