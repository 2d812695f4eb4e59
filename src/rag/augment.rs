//! Context injection.
//!
//! [`ContextualQueryAugmenter`] wraps the user query in a prompt carrying
//! the retrieved documents. What happens when nothing was retrieved is
//! decided by the configured [`EmptyContextPolicy`].

use crate::config::EmptyContextPolicy;
use crate::error::{GatewayError, Result};
use crate::models::{Document, Grounding};

const DECLINE_PROMPT: &str = "The user query is outside your knowledge base.\n\
                              Politely inform the user that you can't answer it.";

/// The final prompt text and whether it is grounded in retrieved context.
#[derive(Debug, Clone, PartialEq)]
pub struct AugmentedQuery {
    pub text: String,
    pub grounding: Grounding,
}

pub struct ContextualQueryAugmenter {
    policy: EmptyContextPolicy,
}

impl ContextualQueryAugmenter {
    pub fn new(policy: EmptyContextPolicy) -> Self {
        Self { policy }
    }

    pub fn augment(&self, query: &str, documents: &[Document]) -> Result<AugmentedQuery> {
        if documents.is_empty() {
            return match self.policy {
                EmptyContextPolicy::Allow => Ok(AugmentedQuery {
                    text: query.to_string(),
                    grounding: Grounding::EmptyContext,
                }),
                EmptyContextPolicy::Decline => Ok(AugmentedQuery {
                    text: DECLINE_PROMPT.to_string(),
                    grounding: Grounding::EmptyContext,
                }),
                EmptyContextPolicy::Fail => Err(GatewayError::EmptyContext),
            };
        }

        let context = documents
            .iter()
            .map(|d| d.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let text = format!(
            "Context information is below.\n\n\
             ---------------------\n\
             {context}\n\
             ---------------------\n\n\
             Given the context information and no prior knowledge, answer the query.\n\n\
             Follow these rules:\n\n\
             1. If the answer is not in the context, just say that you don't know.\n\
             2. Avoid statements like \"Based on the context...\" or \"The provided information...\".\n\n\
             Query: {query}\n\n\
             Answer:",
            context = context,
            query = query
        );
        Ok(AugmentedQuery {
            text,
            grounding: Grounding::Grounded,
        })
    }
}

impl Default for ContextualQueryAugmenter {
    fn default() -> Self {
        Self::new(EmptyContextPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_block() {
        let docs = vec![Document::new("Seoul is the capital."), Document::new("It has 10M people.")];
        let out = ContextualQueryAugmenter::default().augment("What is Seoul?", &docs).unwrap();
        assert_eq!(out.grounding, Grounding::Grounded);
        assert!(out
            .text
            .contains("---------------------\nSeoul is the capital.\nIt has 10M people.\n---------------------"));
        assert!(out.text.ends_with("Query: What is Seoul?\n\nAnswer:"));
    }

    #[test]
    fn test_empty_context_allowed() {
        let out = ContextualQueryAugmenter::new(EmptyContextPolicy::Allow)
            .augment("hello", &[])
            .unwrap();
        assert_eq!(out.text, "hello");
        assert_eq!(out.grounding, Grounding::EmptyContext);
    }

    #[test]
    fn test_empty_context_declined() {
        let out = ContextualQueryAugmenter::new(EmptyContextPolicy::Decline)
            .augment("hello", &[])
            .unwrap();
        assert!(out.text.starts_with("The user query is outside your knowledge base."));
        assert_eq!(out.grounding, Grounding::EmptyContext);
    }

    #[test]
    fn test_empty_context_fails() {
        let err = ContextualQueryAugmenter::new(EmptyContextPolicy::Fail)
            .augment("hello", &[])
            .unwrap_err();
        assert_eq!(err.code(), "empty_context");
    }
}
