//! Prompt for grounded answers

use std::fmt::Write;
use strata_core::Document;

const INSTRUCTION: &str = "Answer the question using only the sources below and cite each \
statement as [id]. If the sources do not contain the answer, say that the information could \
not be found.";

/// Render the grounded-answer prompt, sources in retrieval order
pub fn grounded_prompt(question: &str, documents: &[Document]) -> String {
    let mut prompt = String::from(INSTRUCTION);

    if documents.is_empty() {
        prompt.push_str("\n\nSources: none");
    } else {
        prompt.push_str("\n\nSources:");
        for doc in documents {
            // Writing to a String cannot fail
            let _ = write!(prompt, "\n[{}] {}", doc.id, doc.snippet.trim());
        }
    }

    let _ = write!(prompt, "\n\nQuestion: {}", question.trim());
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sources_keep_retrieval_order() {
        let prompt = grounded_prompt(
            "What is the refund policy?",
            &[
                Document::new("doc1", 0.9, "Our refund policy is 30 days."),
                Document::new("doc3", 0.3, "Refunds now require a receipt."),
            ],
        );

        let first = prompt.find("[doc1] Our refund policy").unwrap();
        let second = prompt.find("[doc3] Refunds now").unwrap();
        assert!(first < second);
        assert!(prompt.ends_with("\n\nQuestion: What is the refund policy?"));
    }

    #[test]
    fn test_empty_context_is_explicit() {
        let prompt = grounded_prompt("anything", &[]);
        assert!(prompt.contains("Sources: none"));
        assert!(!prompt.contains("\n["));
    }
}
