//! Per-context semantic answer index
//!
//! For each `(model, context, decoding)` triple the store keeps a short
//! list of `(query embedding, answer key)` pairs. A query whose embedding
//! is close enough to a stored one reuses that answer, but only within the
//! same context, so a semantic hit is never computed against other
//! documents than the ones just retrieved.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use strata_core::Result;
use strata_store::{ErrorTally, ResilientStore};

/// Cosine similarity; `0.0` for mismatched or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SemanticEntry {
    embedding: Vec<f32>,
    answer_key: String,
}

/// A semantic match
#[derive(Debug, Clone, PartialEq)]
pub struct SemanticMatch {
    pub answer_key: String,
    pub similarity: f32,
}

/// Semantic lookup over stored query embeddings
#[derive(Clone)]
pub struct SemanticIndex {
    store: ResilientStore,
    threshold: f32,
    capacity: usize,
    ttl: Duration,
}

impl SemanticIndex {
    pub fn new(store: ResilientStore, threshold: f32, capacity: usize, ttl: Duration) -> Self {
        Self {
            store,
            threshold,
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    async fn load(&self, index_key: &str, tally: &ErrorTally) -> Result<Vec<SemanticEntry>> {
        let Some(raw) = self.store.get(index_key, tally).await? else {
            return Ok(Vec::new());
        };

        match serde_json::from_slice(&raw) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                tracing::warn!(index_key, error = %e, "Dropping undecodable semantic index");
                self.store.delete(&[index_key.to_string()], tally).await?;
                Ok(Vec::new())
            }
        }
    }

    /// Best stored answer at or above the threshold
    pub async fn lookup(
        &self,
        index_key: &str,
        embedding: &[f32],
        tally: &ErrorTally,
    ) -> Result<Option<SemanticMatch>> {
        let entries = self.load(index_key, tally).await?;

        let best = entries
            .into_iter()
            .map(|entry| SemanticMatch {
                similarity: cosine_similarity(&entry.embedding, embedding),
                answer_key: entry.answer_key,
            })
            .filter(|m| m.similarity >= self.threshold)
            .max_by(|a, b| a.similarity.total_cmp(&b.similarity));

        Ok(best)
    }

    /// Remember which answer a query embedding produced
    ///
    /// Read-modify-write without a lock: a concurrent writer may drop one
    /// entry, which only costs a future semantic hit.
    pub async fn record(
        &self,
        index_key: &str,
        embedding: &[f32],
        answer_key: &str,
        tally: &ErrorTally,
    ) -> Result<()> {
        let mut entries = self.load(index_key, tally).await?;
        entries.retain(|entry| entry.answer_key != answer_key);
        entries.push(SemanticEntry {
            embedding: embedding.to_vec(),
            answer_key: answer_key.to_string(),
        });
        if entries.len() > self.capacity {
            let excess = entries.len() - self.capacity;
            entries.drain(..excess);
        }

        let raw = serde_json::to_vec(&entries)?;
        self.store.set(index_key, &raw, self.ttl, tally).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use strata_store::MemoryStore;

    fn index(threshold: f32, capacity: usize) -> SemanticIndex {
        let store = ResilientStore::new(
            Arc::new(MemoryStore::new()),
            true,
            Duration::from_millis(100),
        );
        SemanticIndex::new(store, threshold, capacity, Duration::from_secs(60))
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_lookup_respects_threshold() {
        let index = index(0.9, 8);
        let tally = ErrorTally::new();

        index
            .record("semantic:m:c:d", &[1.0, 0.0], "answer:a", &tally)
            .await
            .unwrap();

        let close = index
            .lookup("semantic:m:c:d", &[0.99, 0.1], &tally)
            .await
            .unwrap();
        assert_eq!(close.unwrap().answer_key, "answer:a");

        let far = index
            .lookup("semantic:m:c:d", &[0.5, 0.5], &tally)
            .await
            .unwrap();
        assert!(far.is_none());

        let other_context = index
            .lookup("semantic:m:other:d", &[1.0, 0.0], &tally)
            .await
            .unwrap();
        assert!(other_context.is_none());
    }

    #[tokio::test]
    async fn test_best_match_wins() {
        let index = index(0.5, 8);
        let tally = ErrorTally::new();

        index.record("s", &[1.0, 0.0], "answer:x", &tally).await.unwrap();
        index.record("s", &[0.0, 1.0], "answer:y", &tally).await.unwrap();

        let found = index.lookup("s", &[0.2, 0.9], &tally).await.unwrap().unwrap();
        assert_eq!(found.answer_key, "answer:y");
    }

    #[tokio::test]
    async fn test_capacity_drops_oldest() {
        let index = index(0.99, 2);
        let tally = ErrorTally::new();

        index.record("s", &[1.0, 0.0, 0.0], "answer:1", &tally).await.unwrap();
        index.record("s", &[0.0, 1.0, 0.0], "answer:2", &tally).await.unwrap();
        index.record("s", &[0.0, 0.0, 1.0], "answer:3", &tally).await.unwrap();

        assert!(index.lookup("s", &[1.0, 0.0, 0.0], &tally).await.unwrap().is_none());
        assert!(index.lookup("s", &[0.0, 0.0, 1.0], &tally).await.unwrap().is_some());
    }
}
