//! Embedding cache layer
//!
//! Memoizes `(model, normalized text) → vector` under
//! `embed:{model}:{text-fp}` with a long TTL. Vectors whose dimension does
//! not match the provider are rejected on the way in and dropped on the
//! way out.

use crate::fingerprint::NormalizedQuery;
use crate::guard::{Guarded, StampedeGuard};
use crate::local::LocalTier;
use crate::revalidate::Revalidator;
use crate::{call_provider, codec, keys, Layered};
use std::sync::Arc;
use std::time::Duration;
use strata_core::{
    EmbeddingProvider, LayerOutcome, PipelineConfig, ProviderKind, Result, StrataError,
};
use strata_store::{ErrorTally, ResilientStore};

#[derive(Clone)]
pub struct EmbeddingCache {
    store: ResilientStore,
    provider: Arc<dyn EmbeddingProvider>,
    model_id: String,
    ttl: Duration,
    provider_timeout: Duration,
    guard: Option<StampedeGuard>,
    local: Option<LocalTier>,
    revalidator: Option<Revalidator>,
}

impl EmbeddingCache {
    pub fn new(
        store: ResilientStore,
        provider: Arc<dyn EmbeddingProvider>,
        config: &PipelineConfig,
    ) -> Self {
        let guard = StampedeGuard::from_config(store.clone(), config);

        Self {
            model_id: config.embedding_model_id.clone(),
            ttl: config.embedding_ttl(),
            provider_timeout: config.provider_timeout(),
            guard: config.embedding_single_flight.then(|| guard.clone()),
            local: (config.local_tier_capacity > 0)
                .then(|| LocalTier::new(config.local_tier_capacity, config.embedding_ttl())),
            revalidator: config
                .stale_threshold()
                .map(|threshold| Revalidator::new(store.clone(), guard, threshold)),
            store,
            provider,
        }
    }

    /// The per-process tier, when enabled
    pub fn local_tier(&self) -> Option<&LocalTier> {
        self.local.as_ref()
    }

    pub fn key(&self, query: &NormalizedQuery) -> String {
        keys::embed(&self.model_id, &query.fingerprint)
    }

    /// Embedding of a normalized query
    pub async fn get_embedding(&self, query: &NormalizedQuery) -> Result<Layered<Vec<f32>>> {
        let key = self.key(query);
        let tally = Arc::new(ErrorTally::new());

        if let Some(local) = &self.local {
            if let Some(embedding) = local.get(&key).await {
                tracing::debug!(key = %key, "Embedding served from local tier");
                return Ok(Layered::new(embedding.to_vec(), LayerOutcome::Hit, &tally));
            }
        }

        if let Some(embedding) = self.lookup(&key, &tally).await? {
            tracing::debug!(key = %key, "Embedding cache hit");
            self.remember_locally(&key, &embedding).await;
            self.revalidate(&key, query, &tally).await;
            return Ok(Layered::new(embedding, LayerOutcome::Hit, &tally));
        }

        let (embedding, outcome) = match &self.guard {
            Some(guard) => {
                let this = self.clone();
                let miss_key = key.clone();
                let text = query.text.clone();
                let miss_tally = tally.clone();
                let miss = async move { this.compute(&miss_key, &text, &miss_tally).await };

                let key_ref = key.as_str();
                let tally_ref: &ErrorTally = &tally;
                match guard
                    .run(&key, &tally, move || self.lookup(key_ref, tally_ref), miss)
                    .await?
                {
                    Guarded::Cached(embedding) => (embedding, LayerOutcome::Hit),
                    Guarded::Computed(embedding) => (embedding, LayerOutcome::Miss),
                }
            }
            None => (
                self.compute(&key, &query.text, &tally).await?,
                LayerOutcome::Miss,
            ),
        };

        tracing::debug!(key = %key, %outcome, "Embedding resolved");
        Ok(Layered::new(embedding, outcome, &tally))
    }

    async fn lookup(&self, key: &str, tally: &ErrorTally) -> Result<Option<Vec<f32>>> {
        let Some(raw) = self.store.get(key, tally).await? else {
            return Ok(None);
        };

        match codec::decode_embedding(&raw, Some(self.provider.dimension())) {
            Ok(embedding) => Ok(Some(embedding)),
            Err(e) => {
                tracing::warn!(key, error = %e, "Dropping unusable embedding record");
                self.store.delete(&[key.to_string()], tally).await?;
                Ok(None)
            }
        }
    }

    async fn compute(&self, key: &str, text: &str, tally: &ErrorTally) -> Result<Vec<f32>> {
        let embedding = call_provider(
            ProviderKind::Embedding,
            self.provider_timeout,
            self.provider.embed(text),
        )
        .await?;

        let expected = self.provider.dimension();
        if embedding.len() != expected {
            return Err(StrataError::DimensionMismatch {
                expected,
                actual: embedding.len(),
            });
        }

        self.store
            .set(key, &codec::encode_embedding(&embedding), self.ttl, tally)
            .await?;
        self.remember_locally(key, &embedding).await;
        Ok(embedding)
    }

    async fn remember_locally(&self, key: &str, embedding: &[f32]) {
        if let Some(local) = &self.local {
            local
                .insert(key.to_string(), Arc::new(embedding.to_vec()))
                .await;
        }
    }

    async fn revalidate(&self, key: &str, query: &NormalizedQuery, tally: &ErrorTally) {
        let Some(revalidator) = &self.revalidator else {
            return;
        };

        let this = self.clone();
        let refresh_key = key.to_string();
        let text = query.text.clone();
        revalidator
            .maybe_refresh(key, tally, move || async move {
                this.compute(&refresh_key, &text, &ErrorTally::new())
                    .await
                    .map(|_| ())
            })
            .await;
    }
}
