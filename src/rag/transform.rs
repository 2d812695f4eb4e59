//! Query translation.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::llm::ChatModel;
use crate::models::{ChatOptions, ChatRequest, Message};

/// Rewrites a query into another form before retrieval.
#[async_trait]
pub trait QueryTransformer: Send + Sync {
    async fn transform(&self, query: &str) -> Result<String>;
}

/// Translates queries into the language the index was built from.
pub struct TranslationQueryTransformer {
    model: Arc<dyn ChatModel>,
    target_language: String,
}

impl TranslationQueryTransformer {
    pub fn new(model: Arc<dyn ChatModel>, target_language: impl Into<String>) -> Self {
        Self {
            model,
            target_language: target_language.into(),
        }
    }

    pub fn target_language(&self) -> &str {
        &self.target_language
    }
}

#[async_trait]
impl QueryTransformer for TranslationQueryTransformer {
    async fn transform(&self, query: &str) -> Result<String> {
        let prompt = format!(
            "Given a user query, translate it to {lang}.\n\
             If the query is already in {lang}, return it unchanged.\n\
             If you don't know the language of the query, return it unchanged.\n\
             Do not add explanations nor any other text.\n\n\
             Original query: {query}\n\n\
             Translated query:",
            lang = self.target_language,
            query = query
        );
        let request = ChatRequest {
            messages: vec![Message::user(prompt)],
            options: ChatOptions {
                temperature: Some(0.0),
                ..Default::default()
            },
            ..Default::default()
        };
        let response = self.model.generate(&request).await?;

        let translated = response.content.trim();
        if translated.is_empty() {
            tracing::warn!(language = %self.target_language, "translation was blank, keeping original query");
            return Ok(query.to_string());
        }
        Ok(translated.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedModel;

    #[tokio::test]
    async fn test_translates() {
        let model = ScriptedModel::constant("  서울 날씨  \n");
        let transformer = TranslationQueryTransformer::new(model.clone(), "korean");
        assert_eq!(transformer.transform("Seoul weather").await.unwrap(), "서울 날씨");
        assert!(model.recorded()[0].messages[0]
            .content
            .starts_with("Given a user query, translate it to korean."));
    }

    #[tokio::test]
    async fn test_blank_reply_keeps_query() {
        let transformer = TranslationQueryTransformer::new(ScriptedModel::constant(""), "korean");
        assert_eq!(transformer.transform("hello").await.unwrap(), "hello");
    }
}
