//! End-to-end pipeline scenarios over the offline providers

use async_trait::async_trait;
use futures::TryStreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strata_cache::CorpusChange;
use strata_core::{
    DecodingParams, EmbeddingProvider, GenerationRequest, LayerOutcome, LlmClient, PipelineConfig,
    QueryOptions, Result, StrataError,
};
use strata_rag::providers::{ExtractiveLlm, HashingEmbedder, InMemoryIndex};
use strata_rag::RagPipeline;
use strata_store::{CacheStore, FailingStore, KeyTtl, MemoryStore};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Fixture
// ============================================================================

struct CountingEmbedder {
    inner: HashingEmbedder,
    calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for CountingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.embed(text).await
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn name(&self) -> &str {
        "counting"
    }
}

struct CountingLlm {
    inner: ExtractiveLlm,
    calls: AtomicUsize,
    delay: Duration,
}

#[async_trait]
impl LlmClient for CountingLlm {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.generate(request).await
    }

    fn name(&self) -> &str {
        "counting"
    }
}

struct Fixture {
    pipeline: RagPipeline,
    index: InMemoryIndex,
    store: Arc<dyn CacheStore>,
    embedder: Arc<CountingEmbedder>,
    llm: Arc<CountingLlm>,
}

impl Fixture {
    async fn new(config: PipelineConfig) -> Self {
        Self::build(config, Arc::new(MemoryStore::new()), Duration::ZERO).await
    }

    async fn build(
        config: PipelineConfig,
        store: Arc<dyn CacheStore>,
        llm_delay: Duration,
    ) -> Self {
        // Documents are embedded by their own embedder so the counter only
        // sees query embeddings
        let index = InMemoryIndex::new(Arc::new(HashingEmbedder::new()));
        index.add("doc1", "Our refund policy is 30 days.").await.unwrap();
        index.add("doc2", "Shipping takes 3–5 days.").await.unwrap();

        let embedder = Arc::new(CountingEmbedder {
            inner: HashingEmbedder::new(),
            calls: AtomicUsize::new(0),
        });
        let llm = Arc::new(CountingLlm {
            inner: ExtractiveLlm,
            calls: AtomicUsize::new(0),
            delay: llm_delay,
        });

        let pipeline = RagPipeline::new(
            config,
            store.clone(),
            Duration::from_millis(100),
            embedder.clone(),
            Arc::new(index.clone()),
            llm.clone(),
        )
        .unwrap();

        Self {
            pipeline,
            index,
            store,
            embedder,
            llm,
        }
    }

    fn llm_calls(&self) -> usize {
        self.llm.calls.load(Ordering::SeqCst)
    }

    async fn keys(&self, prefix: &str) -> Vec<String> {
        self.store.scan(prefix).try_collect().await.unwrap()
    }

    async fn tag_members(&self, tag: &str) -> Vec<String> {
        let mut members = self.store.set_members(tag).await.unwrap();
        members.sort();
        members
    }

    async fn remaining_ttl(&self, key: &str) -> Duration {
        match self.store.ttl(key).await.unwrap() {
            KeyTtl::Remaining(left) => left,
            other => panic!("{key} has no expiry: {other:?}"),
        }
    }
}

const S1_QUERY: &str = "What is the refund policy?";

fn outcomes(response: &strata_core::QueryResponse) -> [LayerOutcome; 3] {
    let report = response.cache_report;
    [report.embed, report.search, report.answer]
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn s1_cold_query_misses_every_layer() {
    let fx = Fixture::new(PipelineConfig::default()).await;

    let response = fx.pipeline.query(S1_QUERY).await.unwrap();

    assert_eq!(outcomes(&response), [LayerOutcome::Miss; 3]);
    assert!(!response.cache_report.store_errors);
    assert_eq!(response.sources[0].id, "doc1");
    assert!(response.answer.contains("30 days"));
}

#[tokio::test]
async fn s2_warm_repeat_hits_every_layer() {
    let fx = Fixture::new(PipelineConfig::default()).await;

    let cold = fx.pipeline.query(S1_QUERY).await.unwrap();
    let warm = fx.pipeline.query(S1_QUERY).await.unwrap();

    assert_eq!(outcomes(&warm), [LayerOutcome::Hit; 3]);
    assert!(warm.cache_report.all_hits());
    assert_eq!(warm.answer, cold.answer);
    assert_eq!(warm.sources, cold.sources);
    assert_eq!(fx.llm_calls(), 1);
    assert_eq!(fx.embedder.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn s3_paraphrase_misses_without_semantic_lookup() {
    let fx = Fixture::new(PipelineConfig::default()).await;
    fx.pipeline.query(S1_QUERY).await.unwrap();

    let response = fx.pipeline.query("Tell me about refunds.").await.unwrap();

    assert_eq!(outcomes(&response), [LayerOutcome::Miss; 3]);
    assert_eq!(response.sources[0].id, "doc1");
    assert_eq!(fx.llm_calls(), 2);
}

#[tokio::test]
async fn s4_paraphrase_hits_semantic_index() {
    let fx = Fixture::new(PipelineConfig {
        semantic_similarity_threshold: Some(0.95),
        ..Default::default()
    })
    .await;

    let first = fx
        .pipeline
        .query("Tell me about the refund policy")
        .await
        .unwrap();
    let paraphrase = fx.pipeline.query(S1_QUERY).await.unwrap();

    assert_eq!(paraphrase.cache_report.embed, LayerOutcome::Miss);
    assert_eq!(paraphrase.cache_report.answer, LayerOutcome::Semantic);
    assert_eq!(paraphrase.answer, first.answer);
    assert_eq!(fx.llm_calls(), 1);

    // Not similar enough at this threshold
    let loose = fx.pipeline.query("Tell me about refunds.").await.unwrap();
    assert_eq!(loose.cache_report.answer, LayerOutcome::Miss);
}

#[tokio::test]
async fn s5_corpus_change_invalidates_retrieval() {
    let fx = Fixture::new(PipelineConfig::default()).await;
    fx.pipeline.query(S1_QUERY).await.unwrap();

    fx.index
        .add("doc3", "Refunds now require a receipt.")
        .await
        .unwrap();
    fx.pipeline
        .corpus_changed(&CorpusChange::added(["doc3"]))
        .await;

    let response = fx.pipeline.query(S1_QUERY).await.unwrap();

    assert_eq!(response.cache_report.embed, LayerOutcome::Hit);
    assert_eq!(response.cache_report.search, LayerOutcome::Miss);
    assert_eq!(response.cache_report.answer, LayerOutcome::Miss);
    assert!(response.sources.iter().any(|d| d.id == "doc3"));
    assert!(response.answer.contains("receipt"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn s6_stampede_calls_guarded_providers_once() {
    let fx = Fixture::build(
        PipelineConfig {
            embedding_single_flight: true,
            retrieval_single_flight: true,
            ..Default::default()
        },
        Arc::new(MemoryStore::new()),
        Duration::from_millis(100),
    )
    .await;

    let mut handles = Vec::new();
    for _ in 0..100 {
        let pipeline = fx.pipeline.clone();
        handles.push(tokio::spawn(
            async move { pipeline.query(S1_QUERY).await.unwrap() },
        ));
    }

    let mut answers = Vec::new();
    let mut answer_misses = 0;
    for handle in handles {
        let response = handle.await.unwrap();
        if response.cache_report.answer == LayerOutcome::Miss {
            answer_misses += 1;
        } else {
            assert_eq!(response.cache_report.answer, LayerOutcome::Hit);
        }
        answers.push(response.answer);
    }

    assert_eq!(fx.llm_calls(), 1);
    assert_eq!(fx.embedder.calls.load(Ordering::SeqCst), 1);
    assert_eq!(answer_misses, 1);
    answers.dedup();
    assert_eq!(answers.len(), 1);
}

// ============================================================================
// Properties
// ============================================================================

#[tokio::test]
async fn version_bump_orphans_retrieval_entries() {
    let fx = Fixture::new(PipelineConfig::default()).await;
    fx.pipeline.query(S1_QUERY).await.unwrap();

    let version = fx.pipeline.invalidator().bump_version().await.unwrap();
    assert_eq!(version, 1);

    let response = fx.pipeline.query(S1_QUERY).await.unwrap();
    assert_eq!(response.cache_report.search, LayerOutcome::Miss);
    // Same context, same answer key
    assert_eq!(response.cache_report.answer, LayerOutcome::Hit);
}

#[tokio::test]
async fn failing_store_still_answers_correctly() {
    let failing = Arc::new(FailingStore::new());
    let fx = Fixture::build(PipelineConfig::default(), failing.clone(), Duration::ZERO).await;

    for _ in 0..2 {
        let response = fx.pipeline.query(S1_QUERY).await.unwrap();
        assert_eq!(outcomes(&response), [LayerOutcome::Miss; 3]);
        assert!(response.cache_report.store_errors);
        assert_eq!(response.sources[0].id, "doc1");
        assert!(response.answer.contains("30 days"));
    }

    assert_eq!(fx.llm_calls(), 2);
    assert!(failing.calls() > 0);
    assert!(fx.pipeline.store().store_errors() > 0);
}

#[tokio::test]
async fn failing_store_surfaces_without_fallback() {
    let fx = Fixture::build(
        PipelineConfig {
            fallback_on_store_error: false,
            ..Default::default()
        },
        Arc::new(FailingStore::new()),
        Duration::ZERO,
    )
    .await;

    let err = fx.pipeline.query(S1_QUERY).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(fx.llm_calls(), 0);
}

#[tokio::test]
async fn nondeterministic_answers_are_never_cached() {
    let fx = Fixture::new(PipelineConfig::default()).await;
    let sampled = QueryOptions::default().with_decoding(DecodingParams {
        temperature: 0.7,
        ..Default::default()
    });

    for _ in 0..2 {
        let response = fx
            .pipeline
            .query_with_options(S1_QUERY, sampled.clone())
            .await
            .unwrap();
        assert_eq!(response.cache_report.answer, LayerOutcome::Skipped);
        assert!(response.answer.contains("30 days"));
    }

    assert_eq!(fx.llm_calls(), 2);
    assert!(fx.keys("answer:").await.is_empty());
    assert!(fx.keys("semantic:").await.is_empty());
}

#[tokio::test]
async fn strict_mode_refuses_nondeterministic_decoding() {
    let fx = Fixture::new(PipelineConfig {
        answer_cache_required: true,
        ..Default::default()
    })
    .await;

    let err = fx
        .pipeline
        .query_with_options(
            S1_QUERY,
            QueryOptions::default().with_decoding(DecodingParams {
                temperature: 1.0,
                ..Default::default()
            }),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, StrataError::Usage(_)));
    assert_eq!(fx.llm_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn tombstones_expire_at_negative_ttl() {
    let config = PipelineConfig::default();
    let negative_ttl = config.negative_ttl();
    let fx = Fixture::new(config).await;
    let question = "warehouse location";

    let cold = fx.pipeline.query(question).await.unwrap();
    assert_eq!(cold.cache_report.search, LayerOutcome::Miss);
    assert!(cold.sources.is_empty());
    assert_eq!(fx.keys("neg:search:").await.len(), 1);

    // A new document is not visible while the tombstone lives
    fx.index
        .add("doc4", "The warehouse location is Rotterdam.")
        .await
        .unwrap();
    let cached = fx.pipeline.query(question).await.unwrap();
    assert_eq!(cached.cache_report.search, LayerOutcome::Hit);
    assert!(cached.sources.is_empty());

    tokio::time::advance(negative_ttl + Duration::from_secs(1)).await;

    let expired = fx.pipeline.query(question).await.unwrap();
    assert_eq!(expired.cache_report.search, LayerOutcome::Miss);
    assert_eq!(expired.sources[0].id, "doc4");
}

#[tokio::test]
async fn raising_semantic_threshold_never_adds_semantic_hits() {
    // Every query retrieves only doc1, so all share one semantic index
    let workload = [
        "What is the refund policy?",
        "Refund policy please",
        "refund policy details",
        "refund window",
        "refund policy window details",
    ];

    let mut counts = Vec::new();
    for threshold in [0.4, 0.75, 0.95] {
        let fx = Fixture::new(PipelineConfig {
            semantic_similarity_threshold: Some(threshold),
            ..Default::default()
        })
        .await;

        let mut semantic = 0;
        for question in workload {
            let response = fx.pipeline.query(question).await.unwrap();
            assert_eq!(response.sources.len(), 1);
            if response.cache_report.answer == LayerOutcome::Semantic {
                semantic += 1;
            }
        }
        counts.push(semantic);
    }

    assert!(counts.windows(2).all(|w| w[0] >= w[1]), "{counts:?}");
    assert!(counts[0] > counts[2], "{counts:?}");
}

#[tokio::test(start_paused = true)]
async fn cancelled_query_still_populates_answer_cache() {
    let fx = Fixture::build(
        PipelineConfig::default(),
        Arc::new(MemoryStore::new()),
        Duration::from_millis(200),
    )
    .await;

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = fx
        .pipeline
        .query_with_cancel(S1_QUERY, QueryOptions::default(), token)
        .await
        .unwrap_err();
    assert!(matches!(err, StrataError::Cancelled));

    // The abandoned generation finishes in the background
    tokio::time::sleep(Duration::from_millis(500)).await;

    let response = fx.pipeline.query(S1_QUERY).await.unwrap();
    assert_eq!(response.cache_report.answer, LayerOutcome::Hit);
    assert_eq!(fx.llm_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn near_expiry_answer_is_served_and_refreshed() {
    let fx = Fixture::new(PipelineConfig {
        answer_ttl_seconds: 60,
        stale_revalidate_threshold_seconds: Some(30),
        ..Default::default()
    })
    .await;

    let cold = fx.pipeline.query(S1_QUERY).await.unwrap();
    let answer_key = fx.keys("answer:").await.remove(0);

    tokio::time::advance(Duration::from_secs(40)).await;

    let stale = fx.pipeline.query(S1_QUERY).await.unwrap();
    assert_eq!(stale.cache_report.answer, LayerOutcome::Hit);
    assert_eq!(stale.answer, cold.answer);

    // Let the background refresh finish
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(fx.llm_calls(), 2);
    let left = fx.remaining_ttl(&answer_key).await;
    assert!(left > Duration::from_secs(50), "{left:?}");
}

#[tokio::test(start_paused = true)]
async fn near_expiry_retrieval_is_served_and_refreshed() {
    let fx = Fixture::new(PipelineConfig {
        retrieval_ttl_seconds: 60,
        stale_revalidate_threshold_seconds: Some(30),
        ..Default::default()
    })
    .await;

    fx.pipeline.query(S1_QUERY).await.unwrap();
    let search_key = fx.keys("search:").await.remove(0);
    fx.index
        .add("doc3", "Refunds now require a receipt.")
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(40)).await;

    // Served as cached, without the new document
    let stale = fx.pipeline.query(S1_QUERY).await.unwrap();
    assert_eq!(stale.cache_report.search, LayerOutcome::Hit);
    assert!(stale.sources.iter().all(|d| d.id != "doc3"));

    tokio::time::sleep(Duration::from_millis(10)).await;

    let left = fx.remaining_ttl(&search_key).await;
    assert!(left > Duration::from_secs(50), "{left:?}");

    let refreshed = fx.pipeline.query(S1_QUERY).await.unwrap();
    assert_eq!(refreshed.cache_report.search, LayerOutcome::Hit);
    assert!(refreshed.sources.iter().any(|d| d.id == "doc3"));
}

#[tokio::test]
async fn updated_document_drops_its_tagged_entries() {
    let fx = Fixture::new(PipelineConfig::default()).await;
    fx.pipeline.query(S1_QUERY).await.unwrap();
    assert_eq!(fx.keys("answer:").await.len(), 1);

    fx.index
        .update("doc1", "Our refund policy is 60 days.")
        .await
        .unwrap();
    fx.pipeline
        .corpus_changed(&CorpusChange::updated(["doc1"]))
        .await;

    // The answer quoted doc1, so the doc1 tag took it out
    assert!(fx.keys("answer:").await.is_empty());
    assert!(fx.tag_members("tag:doc:doc1").await.is_empty());

    let response = fx.pipeline.query(S1_QUERY).await.unwrap();
    assert_eq!(response.cache_report.search, LayerOutcome::Miss);
    assert_eq!(response.cache_report.answer, LayerOutcome::Miss);
    assert!(response.answer.contains("60 days"));
}

#[tokio::test]
async fn deleted_document_is_never_served_again() {
    let fx = Fixture::new(PipelineConfig::default()).await;
    fx.pipeline.query(S1_QUERY).await.unwrap();

    assert!(fx.index.remove("doc1").await);
    fx.pipeline
        .corpus_changed(&CorpusChange::deleted(["doc1"]))
        .await;
    assert!(fx.keys("answer:").await.is_empty());

    let response = fx.pipeline.query(S1_QUERY).await.unwrap();
    assert_eq!(response.cache_report.answer, LayerOutcome::Miss);
    assert!(response.sources.iter().all(|d| d.id != "doc1"));
    assert!(!response.answer.contains("30 days"));
}

#[tokio::test]
async fn corpus_change_evicts_answers_when_configured() {
    let fx = Fixture::new(PipelineConfig {
        evict_answers_on_corpus_change: true,
        ..Default::default()
    })
    .await;
    fx.pipeline.query(S1_QUERY).await.unwrap();
    fx.pipeline.query("How long does shipping take?").await.unwrap();
    assert_eq!(fx.keys("answer:").await.len(), 2);

    // An addition leaves tags alone; only the eviction removes answers
    fx.pipeline
        .corpus_changed(&CorpusChange::added(["doc3"]))
        .await;
    assert!(fx.keys("answer:").await.is_empty());

    let response = fx.pipeline.query(S1_QUERY).await.unwrap();
    assert_eq!(response.cache_report.answer, LayerOutcome::Miss);
    assert_eq!(fx.llm_calls(), 3);
}

#[tokio::test]
async fn version_bump_sweeps_old_retrieval_keys() {
    let fx = Fixture::new(PipelineConfig::default()).await;
    fx.pipeline.query(S1_QUERY).await.unwrap();
    fx.pipeline.query("warehouse location").await.unwrap();
    assert_eq!(fx.keys("search:0:").await.len(), 1);
    assert_eq!(fx.keys("neg:search:0:").await.len(), 1);

    fx.pipeline.invalidator().bump_version().await.unwrap();

    for _ in 0..100 {
        if fx.tag_members("tag:doc:doc1").await.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(fx.keys("search:0:").await.is_empty());
    assert!(fx.keys("neg:search:0:").await.is_empty());
    assert_eq!(fx.tag_members("tag:doc:doc1").await, fx.keys("answer:").await);
}

#[tokio::test]
async fn tag_sets_stay_bounded_across_version_bumps() {
    let fx = Fixture::new(PipelineConfig::default()).await;

    for _ in 0..50 {
        fx.pipeline.query(S1_QUERY).await.unwrap();
        fx.pipeline.invalidator().bump_version().await.unwrap();
    }

    for _ in 0..200 {
        if fx.tag_members("tag:doc:doc1").await.len() <= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Only the answer survives; every version's retrieval entry was pruned
    let members = fx.tag_members("tag:doc:doc1").await;
    assert_eq!(members, fx.keys("answer:").await);
    assert_eq!(members.len(), 1);
}
