//! Offline providers
//!
//! A deterministic stack that needs no network: feature-hashed
//! bag-of-words embeddings, a brute-force cosine index and an extractive
//! "LLM" that answers by quoting its context. Used by the CLI's `local`
//! provider and by the end-to-end tests.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use strata_cache::cosine_similarity;
use strata_core::{Document, EmbeddingProvider, GenerationRequest, LlmClient, Result, VectorIndex};
use tokio::sync::RwLock;

/// Output dimension of [`HashingEmbedder`]
pub const HASHING_DIMENSION: usize = 1024;

const STOPWORDS: &[&str] = &[
    "a", "about", "an", "and", "are", "can", "do", "does", "for", "how", "i", "in", "is", "it",
    "me", "of", "on", "or", "please", "tell", "the", "to", "what", "when", "which", "who", "why",
];

// ============================================================================
// Hashing Embedder
// ============================================================================

/// Feature-hashing embedder
///
/// Tokens are lowercased alphanumeric runs with stopwords removed and a
/// trailing plural `s` stripped, so "refunds" and "Refund" land in the
/// same bucket. The vector is L2-normalized.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new() -> Self {
        Self::with_dimension(HASHING_DIMENSION)
    }

    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .filter(|t| !STOPWORDS.contains(&t.as_str()))
            .map(|t| {
                if t.ends_with('s') && t.chars().count() > 3 {
                    t[..t.len() - 1].to_string()
                } else {
                    t
                }
            })
    }

    fn bucket(&self, token: &str) -> usize {
        let digest = Sha256::digest(token.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(head) % self.dimension as u64) as usize
    }

    /// Embed synchronously; the async trait method delegates here
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in Self::tokens(text) {
            vector[self.bucket(&token)] += 1.0;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_text(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "hashing"
    }
}

// ============================================================================
// In-Memory Index
// ============================================================================

struct IndexedDocument {
    id: String,
    text: String,
    embedding: Vec<f32>,
}

/// Brute-force cosine index over a small corpus
///
/// Documents with zero similarity are never returned. Ties are broken by
/// id so rankings are stable.
#[derive(Clone)]
pub struct InMemoryIndex {
    embedder: Arc<dyn EmbeddingProvider>,
    documents: Arc<RwLock<Vec<IndexedDocument>>>,
}

impl InMemoryIndex {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            embedder,
            documents: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Add a document, replacing any existing one with the same id
    pub async fn add(&self, id: impl Into<String>, text: impl Into<String>) -> Result<()> {
        let id = id.into();
        let text = text.into();
        let embedding = self.embedder.embed(&text).await?;

        let mut documents = self.documents.write().await;
        documents.retain(|d| d.id != id);
        documents.push(IndexedDocument {
            id,
            text,
            embedding,
        });
        Ok(())
    }

    /// Replace the text of a document
    pub async fn update(&self, id: impl Into<String>, text: impl Into<String>) -> Result<()> {
        self.add(id, text).await
    }

    /// Remove a document; returns whether it existed
    pub async fn remove(&self, id: &str) -> bool {
        let mut documents = self.documents.write().await;
        let before = documents.len();
        documents.retain(|d| d.id != id);
        documents.len() != before
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn search(&self, embedding: &[f32], k: usize) -> Result<Vec<Document>> {
        let documents = self.documents.read().await;

        let mut scored: Vec<Document> = documents
            .iter()
            .filter_map(|d| {
                let score = cosine_similarity(embedding, &d.embedding);
                (score > 0.0).then(|| Document::new(d.id.clone(), score, d.text.clone()))
            })
            .collect();

        scored.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        scored.truncate(k);
        Ok(scored)
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}

// ============================================================================
// Extractive LLM
// ============================================================================

/// Answers by quoting each context snippet followed by its citation
#[derive(Debug, Clone, Default)]
pub struct ExtractiveLlm;

impl ExtractiveLlm {
    pub const NO_CONTEXT: &'static str = "No relevant information was found.";
}

#[async_trait]
impl LlmClient for ExtractiveLlm {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        if request.documents.is_empty() {
            return Ok(Self::NO_CONTEXT.to_string());
        }

        Ok(request
            .documents
            .iter()
            .map(|d| format!("{} [{}]", d.snippet.trim(), d.id))
            .collect::<Vec<_>>()
            .join(" "))
    }

    fn name(&self) -> &str {
        "extractive"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::DecodingParams;

    #[test]
    fn test_stopwords_and_plurals_are_folded() {
        let embedder = HashingEmbedder::new();
        let a = embedder.embed_text("What is the refund policy?");
        let b = embedder.embed_text("refund policies");
        let c = embedder.embed_text("Refunds policy");

        assert!(cosine_similarity(&a, &c) > 0.999);
        assert!(cosine_similarity(&a, &b) < 0.999);
    }

    #[test]
    fn test_embedding_is_unit_length() {
        let v = HashingEmbedder::new().embed_text("Shipping takes 3-5 days.");
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_only_stopwords_embed_to_zero() {
        let v = HashingEmbedder::new().embed_text("what is the");
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn test_index_ranks_and_filters() {
        let embedder = Arc::new(HashingEmbedder::new());
        let index = InMemoryIndex::new(embedder.clone());
        index.add("doc1", "Our refund policy is 30 days.").await.unwrap();
        index.add("doc2", "Shipping takes 3-5 days.").await.unwrap();

        let query = embedder.embed_text("refund policy");
        let results = index.search(&query, 5).await.unwrap();
        assert_eq!(results[0].id, "doc1");
        assert!(results.iter().all(|d| d.score > 0.0));

        assert!(index.remove("doc1").await);
        assert!(!index.remove("doc1").await);
        assert_eq!(index.len().await, 1);
    }

    #[tokio::test]
    async fn test_update_replaces_text() {
        let index = InMemoryIndex::new(Arc::new(HashingEmbedder::new()));
        index.add("doc1", "old text").await.unwrap();
        index.update("doc1", "refund receipt").await.unwrap();

        let query = HashingEmbedder::new().embed_text("receipt");
        let results = index.search(&query, 5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].snippet, "refund receipt");
    }

    #[test]
    fn test_extractive_answer_cites_sources() {
        let request = GenerationRequest {
            question: "refunds?".into(),
            prompt: String::new(),
            documents: vec![
                Document::new("doc1", 0.9, "Our refund policy is 30 days."),
                Document::new("doc3", 0.4, "Refunds now require a receipt."),
            ],
            params: DecodingParams::default(),
        };

        let answer = tokio_test::block_on(ExtractiveLlm.generate(&request)).unwrap();
        assert_eq!(
            answer,
            "Our refund policy is 30 days. [doc1] Refunds now require a receipt. [doc3]"
        );
    }
}
