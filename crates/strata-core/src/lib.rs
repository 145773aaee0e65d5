//! Strata Core - Domain types, provider traits, and shared configuration
//!
//! This crate defines the abstractions shared by every Strata crate:
//! - Retrieval documents, decoding parameters and the per-query cache report
//! - The error type used across the cache layers and the pipeline
//! - Traits for the three injected providers (embedding, vector index, LLM)
//! - Configuration management

pub mod config;

pub use config::{
    AppConfig, ConfigError, LlmConfig, LoggingConfig, PipelineConfig, StoreBackend, StoreConfig,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Which injected provider produced an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Embedding,
    Retrieval,
    Llm,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Embedding => write!(f, "embedding"),
            Self::Retrieval => write!(f, "retrieval"),
            Self::Llm => write!(f, "llm"),
        }
    }
}

/// Core error types for Strata operations
#[derive(Error, Debug)]
pub enum StrataError {
    /// Transient cache store failure (connection refused, timeout, store-side error)
    #[error("Cache store error: {0}")]
    Store(String),

    #[error("{provider} provider error: {message}")]
    Provider {
        provider: ProviderKind,
        message: String,
    },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Query cancelled")]
    Cancelled,

    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalidation error: {0}")]
    Invalidation(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StrataError {
    /// Shorthand for a provider failure
    pub fn provider(provider: ProviderKind, message: impl Into<String>) -> Self {
        Self::Provider {
            provider,
            message: message.into(),
        }
    }

    /// Errors the cache layers may absorb and degrade to a miss
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(_))
    }

    /// Errors raised synchronously for invalid input or configuration; never cached
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            Self::Usage(_) | Self::DimensionMismatch { .. } | Self::Config(_)
        )
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StrataError>;

// ============================================================================
// Retrieval and Generation Types
// ============================================================================

/// A ranked document descriptor returned by the vector index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document identifier in the vector index
    pub id: String,

    /// Relevance score (higher is better)
    pub score: f32,

    /// Content snippet used as generation context
    pub snippet: String,
}

impl Document {
    /// Create a new document descriptor
    pub fn new(id: impl Into<String>, score: f32, snippet: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            score,
            snippet: snippet.into(),
        }
    }
}

/// Decoding parameters passed to the LLM
///
/// Field order is significant: the serialized form is fingerprinted into answer keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecodingParams {
    /// Sampling temperature; only `0.0` is deterministic
    pub temperature: f32,

    /// Nucleus sampling mass
    pub top_p: f32,

    /// Maximum tokens to generate
    pub max_tokens: u32,

    /// Sampling seed, if the provider supports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for DecodingParams {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_p: 1.0,
            max_tokens: 512,
            seed: None,
        }
    }
}

impl DecodingParams {
    /// Greedy decoding with the given token limit
    pub fn greedy(max_tokens: u32) -> Self {
        Self {
            max_tokens,
            ..Default::default()
        }
    }

    /// Whether the same prompt always yields the same answer
    ///
    /// Only answers produced under deterministic decoding may be cached.
    pub fn is_deterministic(&self) -> bool {
        self.temperature == 0.0
    }
}

/// Request handed to an [`LlmClient`]
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// The user's question as typed
    pub question: String,

    /// Rendered prompt including the retrieved context
    pub prompt: String,

    /// Retrieved context documents, in retrieval order
    pub documents: Vec<Document>,

    /// Decoding parameters for this generation
    pub params: DecodingParams,
}

// ============================================================================
// Query Types
// ============================================================================

/// What happened at one cache layer during a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerOutcome {
    Hit,
    Miss,
    /// Answer served through embedding similarity rather than an exact key
    Semantic,
    /// The layer was bypassed (nondeterministic decoding)
    Skipped,
}

impl LayerOutcome {
    /// Whether the value was served from the cache
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit | Self::Semantic)
    }
}

impl std::fmt::Display for LayerOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hit => write!(f, "hit"),
            Self::Miss => write!(f, "miss"),
            Self::Semantic => write!(f, "semantic"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Per-query record of which layers hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheReport {
    pub embed: LayerOutcome,
    pub search: LayerOutcome,
    pub answer: LayerOutcome,

    /// True when at least one store call during the query failed and was absorbed
    #[serde(default)]
    pub store_errors: bool,
}

impl CacheReport {
    /// Whether all three layers were served from the cache
    pub fn all_hits(&self) -> bool {
        self.embed.is_hit() && self.search.is_hit() && self.answer.is_hit()
    }
}

/// Per-call overrides for a query
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Overrides `retrieval_top_k`
    pub top_k: Option<usize>,

    /// Overrides `answer_decoding_params`
    pub decoding: Option<DecodingParams>,
}

impl QueryOptions {
    /// Set top-k
    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = Some(k);
        self
    }

    /// Set decoding parameters
    pub fn with_decoding(mut self, params: DecodingParams) -> Self {
        self.decoding = Some(params);
        self
    }
}

/// Result of a pipeline query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Generated (or cached) answer
    pub answer: String,

    /// Retrieved documents, in retrieval order
    pub sources: Vec<Document>,

    /// Which layers hit
    pub cache_report: CacheReport,
}

// ============================================================================
// Provider Traits
// ============================================================================

/// Trait for embedding providers
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single (already normalized) text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Fixed output dimension of the model
    fn dimension(&self) -> usize;

    /// Provider name for logging
    fn name(&self) -> &str;
}

/// Trait for vector indexes
#[async_trait::async_trait]
pub trait VectorIndex: Send + Sync {
    /// Return up to `k` documents ranked by similarity to `embedding`
    async fn search(&self, embedding: &[f32], k: usize) -> Result<Vec<Document>>;

    /// Index name for logging
    fn name(&self) -> &str;
}

/// Trait for LLM clients
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate an answer
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;

    /// Client name for logging
    fn name(&self) -> &str;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoding_determinism() {
        assert!(DecodingParams::default().is_deterministic());
        assert!(DecodingParams::greedy(256).is_deterministic());

        let sampled = DecodingParams {
            temperature: 0.7,
            ..Default::default()
        };
        assert!(!sampled.is_deterministic());
    }

    #[test]
    fn test_layer_outcome_serde() {
        let report = CacheReport {
            embed: LayerOutcome::Hit,
            search: LayerOutcome::Miss,
            answer: LayerOutcome::Semantic,
            store_errors: false,
        };
        let json = serde_json::to_value(report).unwrap();
        assert_eq!(json["embed"], "hit");
        assert_eq!(json["search"], "miss");
        assert_eq!(json["answer"], "semantic");
        assert!(!report.all_hits());
    }

    #[test]
    fn test_all_hits_counts_semantic() {
        let report = CacheReport {
            embed: LayerOutcome::Hit,
            search: LayerOutcome::Hit,
            answer: LayerOutcome::Semantic,
            store_errors: false,
        };
        assert!(report.all_hits());
    }

    #[test]
    fn test_error_classification() {
        assert!(StrataError::Store("refused".into()).is_transient());
        assert!(!StrataError::provider(ProviderKind::Llm, "boom").is_transient());
        assert!(StrataError::DimensionMismatch {
            expected: 3,
            actual: 4
        }
        .is_usage());

        let err = StrataError::provider(ProviderKind::Embedding, "rate limited");
        assert_eq!(err.to_string(), "embedding provider error: rate limited");
    }

    #[test]
    fn test_decoding_params_reject_unknown_fields() {
        let parsed: std::result::Result<DecodingParams, _> =
            serde_json::from_str(r#"{"temperature":0.0,"top_p":1.0,"max_tokens":10,"beam":4}"#);
        assert!(parsed.is_err());
    }
}
