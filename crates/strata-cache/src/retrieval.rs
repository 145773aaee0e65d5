//! Retrieval cache layer
//!
//! Memoizes ranked search results under
//! `search:{version}:{query-fp}:k{n}`. The version comes from the
//! [`Invalidator`], so a bump orphans every entry at once. Empty results
//! become a short-lived tombstone at `neg:{key}`, and every cached list is
//! tagged `doc:{id}` for each document it contains.

use crate::fingerprint::NormalizedQuery;
use crate::guard::{Guarded, StampedeGuard};
use crate::invalidation::Invalidator;
use crate::revalidate::Revalidator;
use crate::{call_provider, codec, keys, Layered};
use std::sync::Arc;
use std::time::Duration;
use strata_core::{Document, LayerOutcome, PipelineConfig, ProviderKind, Result, VectorIndex};
use strata_store::{ErrorTally, ResilientStore};

#[derive(Clone)]
pub struct RetrievalCache {
    store: ResilientStore,
    index: Arc<dyn VectorIndex>,
    invalidator: Invalidator,
    ttl: Duration,
    negative_ttl: Duration,
    provider_timeout: Duration,
    guard: Option<StampedeGuard>,
    revalidator: Option<Revalidator>,
}

impl RetrievalCache {
    pub fn new(
        store: ResilientStore,
        index: Arc<dyn VectorIndex>,
        invalidator: Invalidator,
        config: &PipelineConfig,
    ) -> Self {
        let guard = StampedeGuard::from_config(store.clone(), config);

        Self {
            invalidator,
            ttl: config.retrieval_ttl(),
            negative_ttl: config.negative_ttl(),
            provider_timeout: config.provider_timeout(),
            guard: config.retrieval_single_flight.then(|| guard.clone()),
            revalidator: config
                .stale_threshold()
                .map(|threshold| Revalidator::new(store.clone(), guard, threshold)),
            store,
            index,
        }
    }

    /// Ranked documents for a query
    ///
    /// When the corpus version cannot be read the cache is bypassed for
    /// this call and the index is queried directly.
    pub async fn search(
        &self,
        query: &NormalizedQuery,
        embedding: &[f32],
        k: usize,
    ) -> Result<Layered<Vec<Document>>> {
        let tally = Arc::new(ErrorTally::new());

        let Some(version) = self.invalidator.read_version(&tally).await? else {
            tracing::debug!("Corpus version unavailable, bypassing retrieval cache");
            let documents = self.query_index(embedding, k).await?;
            return Ok(Layered::new(documents, LayerOutcome::Miss, &tally));
        };

        let key = keys::search(version, &query.fingerprint, k);

        if let Some(documents) = self.lookup(&key, &tally).await? {
            tracing::debug!(key = %key, results = documents.len(), "Retrieval cache hit");
            if !documents.is_empty() {
                self.revalidate(&key, embedding, k, &tally).await;
            }
            return Ok(Layered::new(documents, LayerOutcome::Hit, &tally));
        }

        let (documents, outcome) = match &self.guard {
            Some(guard) => {
                let this = self.clone();
                let miss_key = key.clone();
                let miss_embedding = embedding.to_vec();
                let miss_tally = tally.clone();
                let miss = async move {
                    this.compute(&miss_key, &miss_embedding, k, &miss_tally)
                        .await
                };

                let key_ref = key.as_str();
                let tally_ref: &ErrorTally = &tally;
                match guard
                    .run(&key, &tally, move || self.lookup(key_ref, tally_ref), miss)
                    .await?
                {
                    Guarded::Cached(documents) => (documents, LayerOutcome::Hit),
                    Guarded::Computed(documents) => (documents, LayerOutcome::Miss),
                }
            }
            None => (
                self.compute(&key, embedding, k, &tally).await?,
                LayerOutcome::Miss,
            ),
        };

        tracing::debug!(key = %key, %outcome, results = documents.len(), "Retrieval resolved");
        Ok(Layered::new(documents, outcome, &tally))
    }

    /// Cached list, an empty list for a live tombstone, or `None`
    async fn lookup(&self, key: &str, tally: &ErrorTally) -> Result<Option<Vec<Document>>> {
        if let Some(raw) = self.store.get(key, tally).await? {
            match codec::decode_documents(&raw) {
                Ok(documents) => return Ok(Some(documents)),
                Err(e) => {
                    tracing::warn!(key, error = %e, "Dropping undecodable retrieval record");
                    self.store.delete(&[key.to_string()], tally).await?;
                }
            }
        }

        match self.store.get(&keys::negative(key), tally).await? {
            Some(raw) if codec::is_tombstone(&raw) => Ok(Some(Vec::new())),
            _ => Ok(None),
        }
    }

    async fn query_index(&self, embedding: &[f32], k: usize) -> Result<Vec<Document>> {
        call_provider(
            ProviderKind::Retrieval,
            self.provider_timeout,
            self.index.search(embedding, k),
        )
        .await
    }

    async fn compute(
        &self,
        key: &str,
        embedding: &[f32],
        k: usize,
        tally: &ErrorTally,
    ) -> Result<Vec<Document>> {
        let documents = self.query_index(embedding, k).await?;

        if documents.is_empty() {
            self.store
                .set(&keys::negative(key), codec::TOMBSTONE, self.negative_ttl, tally)
                .await?;
            return Ok(documents);
        }

        self.store
            .set(key, &codec::encode_documents(&documents)?, self.ttl, tally)
            .await?;

        let tags: Vec<String> = documents.iter().map(|doc| keys::doc_tag(&doc.id)).collect();
        self.invalidator.tag(key, &tags, self.ttl, tally).await?;

        Ok(documents)
    }

    async fn revalidate(&self, key: &str, embedding: &[f32], k: usize, tally: &ErrorTally) {
        let Some(revalidator) = &self.revalidator else {
            return;
        };

        let this = self.clone();
        let refresh_key = key.to_string();
        let embedding = embedding.to_vec();
        revalidator
            .maybe_refresh(key, tally, move || async move {
                this.compute(&refresh_key, &embedding, k, &ErrorTally::new())
                    .await
                    .map(|_| ())
            })
            .await;
    }
}
