//! Post-retrieval document processing.

use crate::models::Document;

/// Pure transformation over retrieved documents. Must not touch the index.
pub trait DocumentPostProcessor: Send + Sync {
    fn process(&self, query: &str, documents: Vec<Document>) -> Vec<Document>;
}

/// Prints retrieved documents to stdout and passes them through unchanged.
pub struct SearchResultPrinter;

impl SearchResultPrinter {
    pub fn render(documents: &[Document]) -> String {
        let mut out = String::from("[ Search Results ]\n");
        if documents.is_empty() {
            out.push_str("  (no documents)\n");
        }
        for (i, doc) in documents.iter().enumerate() {
            let source = doc
                .metadata
                .get("source")
                .map(|s| s.to_string())
                .unwrap_or_else(|| doc.id.clone());
            out.push_str(&format!(
                "{}. [{:.3}] {}\n   {}\n",
                i + 1,
                doc.score.unwrap_or_default(),
                source,
                doc.text.replace('\n', " ")
            ));
        }
        out
    }
}

impl DocumentPostProcessor for SearchResultPrinter {
    fn process(&self, _query: &str, documents: Vec<Document>) -> Vec<Document> {
        println!("{}", Self::render(&documents));
        documents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_lists_scores_and_sources() {
        let mut doc = Document::new("line one\nline two").with_metadata("source", "a.md");
        doc.score = Some(0.91234);
        let text = SearchResultPrinter::render(&[doc.clone()]);
        assert!(text.starts_with("[ Search Results ]"));
        assert!(text.contains("1. [0.912] a.md"));
        assert!(text.contains("line one line two"));

        let passed = SearchResultPrinter.process("q", vec![doc.clone()]);
        assert_eq!(passed, vec![doc]);
    }
}
