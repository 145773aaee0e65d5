//! Strata Cache - Layered caching for RAG queries
//!
//! Three cache layers sit between a query and the providers:
//!
//! | Layer | Key | Memoizes |
//! |-------|-----|----------|
//! | [`EmbeddingCache`] | `embed:{model}:{text-fp}` | text → vector |
//! | [`RetrievalCache`] | `search:{version}:{query-fp}:k{n}` | vector → ranked documents |
//! | [`AnswerCache`] | `answer:{model}:{query-fp}:{context-fp}:{decoding-fp}` | context → answer |
//!
//! Supporting pieces: [`Fingerprinter`] for key derivation,
//! [`StampedeGuard`] for single-flight miss paths, [`Invalidator`] for
//! tag/version invalidation, [`Revalidator`] for stale-while-revalidate,
//! [`LocalTier`] as an optional per-process tier, and [`MetricsSink`] for
//! per-layer counters. All shared state lives in the cache store.

pub mod answer;
pub mod codec;
pub mod embedding;
pub mod fingerprint;
pub mod guard;
pub mod invalidation;
pub mod keys;
pub mod local;
pub mod metrics;
pub mod retrieval;
pub mod revalidate;
pub mod semantic;

pub use answer::AnswerCache;
pub use embedding::EmbeddingCache;
pub use fingerprint::{Fingerprinter, NormalizedQuery, Normalizer};
pub use guard::{Guarded, StampedeGuard};
pub use invalidation::{
    CorpusChange, CorpusChangeKind, InvalidationEvent, InvalidationListener, InvalidationMessage,
    Invalidator,
};
pub use local::LocalTier;
pub use metrics::{Layer, LayerStatsReport, MetricsSink, MetricsSnapshot};
pub use retrieval::RetrievalCache;
pub use revalidate::Revalidator;
pub use semantic::{cosine_similarity, SemanticIndex};

use std::future::Future;
use std::time::Duration;
use strata_core::{LayerOutcome, ProviderKind, Result, StrataError};
use strata_store::ErrorTally;

/// Value produced by one cache layer, with what the layer did
#[derive(Debug, Clone, PartialEq)]
pub struct Layered<T> {
    pub value: T,
    pub outcome: LayerOutcome,
    /// Store failures absorbed while producing the value
    pub store_errors: u32,
}

impl<T> Layered<T> {
    pub fn new(value: T, outcome: LayerOutcome, tally: &ErrorTally) -> Self {
        Self {
            value,
            outcome,
            store_errors: tally.count(),
        }
    }
}

/// Run a provider call under the configured timeout
pub(crate) async fn call_provider<T, F>(
    provider: ProviderKind,
    timeout: Duration,
    call: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(StrataError::Timeout {
            operation: format!("{provider} provider call"),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}
