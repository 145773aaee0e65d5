//! Answer cache layer
//!
//! Memoizes generated answers under
//! `answer:{model}:{query-fp}:{context-fp}:{decoding-fp}`, so a change in
//! any input that can change the answer lands on a different key. Only
//! deterministic decoding is cached; anything else is answered live and
//! reported as skipped. Misses always go through the [`StampedeGuard`].
//!
//! Lookup order is exact key first, then the per-context semantic index
//! when a similarity threshold is configured.

use crate::fingerprint::{self, NormalizedQuery};
use crate::guard::{Guarded, StampedeGuard};
use crate::invalidation::Invalidator;
use crate::revalidate::Revalidator;
use crate::semantic::SemanticIndex;
use crate::{call_provider, codec, keys, Layered};
use std::sync::Arc;
use std::time::Duration;
use strata_core::{
    GenerationRequest, LayerOutcome, LlmClient, PipelineConfig, ProviderKind, Result, StrataError,
};
use strata_store::{ErrorTally, ResilientStore};

#[derive(Clone)]
pub struct AnswerCache {
    store: ResilientStore,
    llm: Arc<dyn LlmClient>,
    invalidator: Invalidator,
    model_id: String,
    ttl: Duration,
    provider_timeout: Duration,
    cache_required: bool,
    guard: StampedeGuard,
    semantic: Option<SemanticIndex>,
    revalidator: Option<Revalidator>,
}

/// Keys derived for one answer lookup
struct AnswerKeys {
    answer: String,
    semantic: String,
}

impl AnswerCache {
    pub fn new(
        store: ResilientStore,
        llm: Arc<dyn LlmClient>,
        invalidator: Invalidator,
        config: &PipelineConfig,
    ) -> Self {
        let guard = StampedeGuard::from_config(store.clone(), config);

        Self {
            invalidator,
            model_id: config.answer_model_id.clone(),
            ttl: config.answer_ttl(),
            provider_timeout: config.provider_timeout(),
            cache_required: config.answer_cache_required,
            semantic: config.semantic_similarity_threshold.map(|threshold| {
                SemanticIndex::new(
                    store.clone(),
                    threshold,
                    config.semantic_index_capacity,
                    config.answer_ttl(),
                )
            }),
            revalidator: config
                .stale_threshold()
                .map(|threshold| Revalidator::new(store.clone(), guard.clone(), threshold)),
            guard,
            store,
            llm,
        }
    }

    fn derive_keys(
        &self,
        query: &NormalizedQuery,
        request: &GenerationRequest,
    ) -> Result<AnswerKeys> {
        let context_fp = fingerprint::context(&request.documents);
        let decoding_fp = fingerprint::decoding(&request.params)?;
        Ok(AnswerKeys {
            answer: keys::answer(&self.model_id, &query.fingerprint, &context_fp, &decoding_fp),
            semantic: keys::semantic(&self.model_id, &context_fp, &decoding_fp),
        })
    }

    /// Answer for a query over its retrieved context
    ///
    /// # Arguments
    /// * `query` - normalized query
    /// * `embedding` - query embedding, used by the semantic index
    /// * `request` - prompt, context documents and decoding parameters
    pub async fn get_answer(
        &self,
        query: &NormalizedQuery,
        embedding: &[f32],
        request: GenerationRequest,
    ) -> Result<Layered<String>> {
        let tally = Arc::new(ErrorTally::new());

        if !request.params.is_deterministic() {
            if self.cache_required {
                return Err(StrataError::Usage(format!(
                    "temperature {} is nondeterministic and answers must be cached",
                    request.params.temperature
                )));
            }
            tracing::debug!(
                temperature = request.params.temperature,
                "Nondeterministic decoding, answer cache skipped"
            );
            let answer = self.generate(&request).await?;
            return Ok(Layered::new(answer, LayerOutcome::Skipped, &tally));
        }

        let keys = self.derive_keys(query, &request)?;

        if let Some(answer) = self.lookup(&keys.answer, &tally).await? {
            tracing::debug!(key = %keys.answer, "Answer cache hit");
            self.revalidate(&keys, embedding, &request, &tally).await;
            return Ok(Layered::new(answer, LayerOutcome::Hit, &tally));
        }

        if let Some(semantic) = &self.semantic {
            if let Some(found) = semantic.lookup(&keys.semantic, embedding, &tally).await? {
                if let Some(answer) = self.lookup(&found.answer_key, &tally).await? {
                    tracing::debug!(
                        key = %found.answer_key,
                        similarity = found.similarity,
                        "Semantic answer hit"
                    );
                    return Ok(Layered::new(answer, LayerOutcome::Semantic, &tally));
                }
            }
        }

        let this = self.clone();
        let miss_keys = AnswerKeys {
            answer: keys.answer.clone(),
            semantic: keys.semantic.clone(),
        };
        let miss_embedding = embedding.to_vec();
        let miss_tally = tally.clone();
        let miss = async move {
            this.compute(&miss_keys, &miss_embedding, &request, &miss_tally)
                .await
        };

        let key_ref = keys.answer.as_str();
        let tally_ref: &ErrorTally = &tally;
        let (answer, outcome) = match self
            .guard
            .run(&keys.answer, &tally, move || self.lookup(key_ref, tally_ref), miss)
            .await?
        {
            Guarded::Cached(answer) => (answer, LayerOutcome::Hit),
            Guarded::Computed(answer) => (answer, LayerOutcome::Miss),
        };

        tracing::debug!(key = %keys.answer, %outcome, "Answer resolved");
        Ok(Layered::new(answer, outcome, &tally))
    }

    async fn lookup(&self, key: &str, tally: &ErrorTally) -> Result<Option<String>> {
        let Some(raw) = self.store.get(key, tally).await? else {
            return Ok(None);
        };

        match codec::decode_answer(raw) {
            Ok(answer) => Ok(Some(answer)),
            Err(e) => {
                tracing::warn!(key, error = %e, "Dropping undecodable answer record");
                self.store.delete(&[key.to_string()], tally).await?;
                Ok(None)
            }
        }
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        call_provider(
            ProviderKind::Llm,
            self.provider_timeout,
            self.llm.generate(request),
        )
        .await
    }

    async fn compute(
        &self,
        target: &AnswerKeys,
        embedding: &[f32],
        request: &GenerationRequest,
        tally: &ErrorTally,
    ) -> Result<String> {
        let answer = self.generate(request).await?;

        self.store
            .set(&target.answer, &codec::encode_answer(&answer), self.ttl, tally)
            .await?;

        let tags: Vec<String> = request
            .documents
            .iter()
            .map(|doc| keys::doc_tag(&doc.id))
            .collect();
        self.invalidator
            .tag(&target.answer, &tags, self.ttl, tally)
            .await?;

        if let Some(semantic) = &self.semantic {
            semantic
                .record(&target.semantic, embedding, &target.answer, tally)
                .await?;
        }

        Ok(answer)
    }

    async fn revalidate(
        &self,
        keys: &AnswerKeys,
        embedding: &[f32],
        request: &GenerationRequest,
        tally: &ErrorTally,
    ) {
        let Some(revalidator) = &self.revalidator else {
            return;
        };

        let this = self.clone();
        let refresh_keys = AnswerKeys {
            answer: keys.answer.clone(),
            semantic: keys.semantic.clone(),
        };
        let embedding = embedding.to_vec();
        let request = request.clone();
        revalidator
            .maybe_refresh(&keys.answer, tally, move || async move {
                this.compute(&refresh_keys, &embedding, &request, &ErrorTally::new())
                    .await
                    .map(|_| ())
            })
            .await;
    }
}
