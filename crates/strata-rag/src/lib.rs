//! Strata RAG - Cached retrieval-augmented generation pipeline
//!
//! [`RagPipeline`] answers a question in four strictly ordered steps:
//!
//! 1. Embed the normalized question ([`EmbeddingCache`])
//! 2. Retrieve the top-k documents ([`RetrievalCache`])
//! 3. Fingerprint the ordered context and answer ([`AnswerCache`])
//! 4. Record per-layer outcomes and return the answer with its sources
//!
//! Every cache call goes through a [`ResilientStore`], so the pipeline keeps
//! answering correctly when the store is unreachable; only latency and
//! provider cost go up.

use std::sync::Arc;
use std::time::Instant;
use strata_cache::{
    AnswerCache, CorpusChange, EmbeddingCache, Fingerprinter, InvalidationListener, Invalidator,
    Layer, MetricsSink, Normalizer, RetrievalCache,
};
use strata_core::{
    CacheReport, EmbeddingProvider, GenerationRequest, LlmClient, PipelineConfig, QueryOptions,
    QueryResponse, Result, StrataError, VectorIndex,
};
use strata_store::{CacheStore, ResilientStore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod prompt;
pub mod providers;

pub use prompt::grounded_prompt;
pub use providers::{create_embedder, create_llm_client};

// ============================================================================
// Pipeline
// ============================================================================

/// The cached RAG pipeline
///
/// Cheap to clone; clones share the store, providers and metrics.
#[derive(Clone)]
pub struct RagPipeline {
    config: Arc<PipelineConfig>,
    store: ResilientStore,
    fingerprinter: Fingerprinter,
    embeddings: EmbeddingCache,
    retrieval: RetrievalCache,
    answers: AnswerCache,
    invalidator: Invalidator,
    metrics: MetricsSink,
}

impl RagPipeline {
    /// Create a new pipeline
    ///
    /// # Arguments
    /// * `config` - pipeline options; validated here
    /// * `store` - shared cache store
    /// * `store_timeout` - upper bound for each store call
    /// * `embedder`, `index`, `llm` - the injected providers
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn CacheStore>,
        store_timeout: std::time::Duration,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        llm: Arc<dyn LlmClient>,
    ) -> Result<Self> {
        config.validate()?;

        let store = ResilientStore::new(store, config.fallback_on_store_error, store_timeout);
        let invalidator = Invalidator::from_config(store.clone(), &config);

        tracing::info!(
            store = store.inner().name(),
            embedder = embedder.name(),
            index = index.name(),
            llm = llm.name(),
            semantic = ?config.semantic_similarity_threshold,
            "RAG pipeline created"
        );

        Ok(Self {
            fingerprinter: Fingerprinter::new(),
            embeddings: EmbeddingCache::new(store.clone(), embedder, &config),
            retrieval: RetrievalCache::new(store.clone(), index, invalidator.clone(), &config),
            answers: AnswerCache::new(store.clone(), llm, invalidator.clone(), &config),
            metrics: MetricsSink::mirrored(store.clone()),
            invalidator,
            store,
            config: Arc::new(config),
        })
    }

    /// Install an extra normalization step applied before fingerprinting
    pub fn with_normalizer(mut self, normalizer: Arc<dyn Normalizer>) -> Self {
        self.fingerprinter = Fingerprinter::new().with_normalizer(normalizer);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &ResilientStore {
        &self.store
    }

    pub fn invalidator(&self) -> &Invalidator {
        &self.invalidator
    }

    pub fn metrics(&self) -> &MetricsSink {
        &self.metrics
    }

    /// Answer a question with the configured defaults
    pub async fn query(&self, text: &str) -> Result<QueryResponse> {
        self.query_with_options(text, QueryOptions::default()).await
    }

    /// Answer a question with per-call overrides
    pub async fn query_with_options(
        &self,
        text: &str,
        options: QueryOptions,
    ) -> Result<QueryResponse> {
        let start_time = Instant::now();

        let query = self.fingerprinter.query(text)?;
        let top_k = options.top_k.unwrap_or(self.config.retrieval_top_k);
        if top_k == 0 {
            return Err(StrataError::Usage("top_k must be at least 1".to_string()));
        }
        let params = options
            .decoding
            .unwrap_or_else(|| self.config.answer_decoding_params.clone());

        let embedded = self.embeddings.get_embedding(&query).await?;
        self.metrics
            .record(Layer::Embed, embedded.outcome, embedded.store_errors)
            .await;

        let retrieved = self
            .retrieval
            .search(&query, &embedded.value, top_k)
            .await?;
        self.metrics
            .record(Layer::Search, retrieved.outcome, retrieved.store_errors)
            .await;

        let request = GenerationRequest {
            question: text.to_string(),
            prompt: grounded_prompt(text, &retrieved.value),
            documents: retrieved.value.clone(),
            params,
        };
        let answered = self
            .answers
            .get_answer(&query, &embedded.value, request)
            .await?;
        self.metrics
            .record(Layer::Answer, answered.outcome, answered.store_errors)
            .await;

        let cache_report = CacheReport {
            embed: embedded.outcome,
            search: retrieved.outcome,
            answer: answered.outcome,
            store_errors: embedded.store_errors + retrieved.store_errors + answered.store_errors
                > 0,
        };

        tracing::info!(
            embed = %cache_report.embed,
            search = %cache_report.search,
            answer = %cache_report.answer,
            store_errors = cache_report.store_errors,
            sources = retrieved.value.len(),
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            "Query answered"
        );

        Ok(QueryResponse {
            answer: answered.value,
            sources: retrieved.value,
            cache_report,
        })
    }

    /// Answer a question, returning [`StrataError::Cancelled`] as soon as
    /// `token` fires
    ///
    /// Miss-path work already handed to the stampede guard keeps running
    /// and still populates the cache.
    pub async fn query_with_cancel(
        &self,
        text: &str,
        options: QueryOptions,
        token: CancellationToken,
    ) -> Result<QueryResponse> {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::debug!("Query cancelled by caller");
                Err(StrataError::Cancelled)
            }
            result = self.query_with_options(text, options) => result,
        }
    }

    /// React to a corpus mutation; failures are logged, never returned
    pub async fn corpus_changed(&self, change: &CorpusChange) {
        self.invalidator.on_corpus_change(change).await;
    }

    /// Keep the local embedding tier coherent with published invalidations
    ///
    /// Returns `None` when no local tier is configured.
    pub async fn spawn_invalidation_listener(
        &self,
        shutdown: CancellationToken,
    ) -> Result<Option<JoinHandle<()>>> {
        let Some(local) = self.embeddings.local_tier() else {
            return Ok(None);
        };

        let handle = InvalidationListener::new(local.clone())
            .spawn(&self.store, shutdown)
            .await?;
        Ok(Some(handle))
    }
}
