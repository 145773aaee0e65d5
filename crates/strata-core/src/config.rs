//! Strata Configuration Management
//!
//! Handles configuration from TOML files and environment variables with
//! defaults suitable for local development. The pipeline options form a
//! closed set: unknown names are rejected rather than ignored.

use crate::DecodingParams;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Cache store connection
    pub store: StoreConfig,

    /// Cache pipeline options
    pub pipeline: PipelineConfig,

    /// Provider configuration
    pub llm: LlmConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_override()
    }

    /// Load from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileReadError {
            path: path.clone(),
            source: e,
        })?;

        Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::ParseError { message, .. } => ConfigError::ParseError { path, message },
            other => other,
        })
    }

    /// Parse from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })
    }

    /// Merge with environment variables (env takes precedence)
    pub fn with_env_override(self) -> Result<Self, ConfigError> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply every recognized variable that `lookup` yields
    ///
    /// Shared by [`Self::from_env`] and [`Self::with_env_override`], so a
    /// file config and a bare environment accept the same variables.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Store
        if let Some(backend) = lookup("STRATA_STORE_BACKEND") {
            self.store.backend = backend.parse()?;
        }
        if let Some(url) = lookup("REDIS_URL") {
            self.store.redis_url = url;
        }
        if let Some(timeout) = lookup("STRATA_STORE_TIMEOUT_MS") {
            self.store.operation_timeout_ms =
                timeout.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "STRATA_STORE_TIMEOUT_MS".to_string(),
                    value: timeout,
                })?;
        }

        // Providers
        if let Some(provider) = lookup("LLM_PROVIDER") {
            self.llm.provider = provider.parse()?;
        }
        if let Some(key) = lookup("OPENAI_API_KEY") {
            self.llm.openai_api_key = Some(key);
        }
        if let Some(url) = lookup("OPENAI_BASE_URL") {
            self.llm.openai_base_url = Some(url);
        }
        if let Some(model) = lookup("EMBEDDING_MODEL") {
            self.pipeline.embedding_model_id = model;
        }
        if let Some(model) = lookup("LLM_MODEL") {
            self.pipeline.answer_model_id = model;
        }

        // Logging
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = lookup("LOG_JSON") {
            self.logging.json_format = matches!(json.as_str(), "1" | "true" | "yes");
        }

        Ok(self)
    }
}

// ============================================================================
// Pipeline Options
// ============================================================================

/// Every recognized pipeline option name
pub const PIPELINE_OPTIONS: &[&str] = &[
    "embedding_model_id",
    "embedding_ttl_seconds",
    "retrieval_top_k",
    "retrieval_ttl_seconds",
    "corpus_version_namespace",
    "answer_model_id",
    "answer_decoding_params",
    "answer_ttl_seconds",
    "negative_ttl_seconds",
    "semantic_similarity_threshold",
    "stampede_lock_ttl_seconds",
    "stale_revalidate_threshold_seconds",
    "fallback_on_store_error",
    "answer_cache_required",
    "embedding_single_flight",
    "retrieval_single_flight",
    "stampede_poll_initial_ms",
    "stampede_poll_max_ms",
    "provider_timeout_ms",
    "semantic_index_capacity",
    "local_tier_capacity",
    "sweep_on_version_bump",
    "evict_answers_on_corpus_change",
];

/// Cache pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Identity mixed into embedding keys
    pub embedding_model_id: String,

    /// Expiration for embedding entries
    pub embedding_ttl_seconds: u64,

    /// Documents to retrieve; mixed into retrieval keys
    pub retrieval_top_k: usize,

    /// Expiration for retrieval entries
    pub retrieval_ttl_seconds: u64,

    /// Name of the corpus version counter
    pub corpus_version_namespace: String,

    /// Identity mixed into answer keys
    pub answer_model_id: String,

    /// Decoding parameters; fingerprinted into answer keys
    pub answer_decoding_params: DecodingParams,

    /// Expiration for answer entries
    pub answer_ttl_seconds: u64,

    /// Expiration for tombstones
    pub negative_ttl_seconds: u64,

    /// Enables semantic answer lookup at this cosine threshold
    pub semantic_similarity_threshold: Option<f32>,

    /// Lifetime of single-flight locks
    pub stampede_lock_ttl_seconds: u64,

    /// Enables stale-while-revalidate below this remaining TTL
    pub stale_revalidate_threshold_seconds: Option<u64>,

    /// Degrade store errors to misses instead of surfacing them
    pub fallback_on_store_error: bool,

    /// Refuse nondeterministic decoding instead of answering uncached
    pub answer_cache_required: bool,

    /// Guard the embedding layer with single-flight locks
    pub embedding_single_flight: bool,

    /// Guard the retrieval layer with single-flight locks
    pub retrieval_single_flight: bool,

    /// First poll interval of a waiting caller
    pub stampede_poll_initial_ms: u64,

    /// Poll interval ceiling of a waiting caller
    pub stampede_poll_max_ms: u64,

    /// Per-call timeout for provider calls
    pub provider_timeout_ms: u64,

    /// Entries kept per semantic index
    pub semantic_index_capacity: usize,

    /// Entries in the per-process embedding tier (0 disables it)
    pub local_tier_capacity: u64,

    /// Delete orphaned keys in the background after a version bump
    pub sweep_on_version_bump: bool,

    /// Purge the answer namespace on corpus mutations
    pub evict_answers_on_corpus_change: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            embedding_model_id: "text-embedding-3-small".to_string(),
            // Embeddings are deterministic per (model, text), keep them a week
            embedding_ttl_seconds: 7 * 24 * 3600,
            retrieval_top_k: 5,
            retrieval_ttl_seconds: 30 * 60,
            corpus_version_namespace: "corpus".to_string(),
            answer_model_id: "gpt-4o-mini".to_string(),
            answer_decoding_params: DecodingParams::default(),
            answer_ttl_seconds: 30 * 60,
            negative_ttl_seconds: 30,
            semantic_similarity_threshold: None,
            stampede_lock_ttl_seconds: 30,
            stale_revalidate_threshold_seconds: None,
            fallback_on_store_error: true,
            answer_cache_required: false,
            embedding_single_flight: false,
            retrieval_single_flight: false,
            stampede_poll_initial_ms: 5,
            stampede_poll_max_ms: 100,
            provider_timeout_ms: 30_000,
            semantic_index_capacity: 64,
            local_tier_capacity: 0,
            sweep_on_version_bump: true,
            evict_answers_on_corpus_change: false,
        }
    }
}

impl PipelineConfig {
    /// Build from named options, rejecting names outside [`PIPELINE_OPTIONS`]
    ///
    /// Options not given keep their defaults.
    pub fn from_options<I, K>(options: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, serde_json::Value)>,
        K: AsRef<str>,
    {
        let mut map = serde_json::Map::new();
        for (name, value) in options {
            let name = name.as_ref();
            if !PIPELINE_OPTIONS.contains(&name) {
                return Err(ConfigError::UnknownOption(name.to_string()));
            }
            map.insert(name.to_string(), value);
        }

        serde_json::from_value(serde_json::Value::Object(map)).map_err(|e| {
            ConfigError::InvalidValue {
                key: "pipeline".to_string(),
                value: e.to_string(),
            }
        })
    }

    /// Check option invariants
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_model_id("embedding_model_id", &self.embedding_model_id)?;
        validate_model_id("answer_model_id", &self.answer_model_id)?;
        validate_model_id("corpus_version_namespace", &self.corpus_version_namespace)?;

        for (key, value) in [
            ("embedding_ttl_seconds", self.embedding_ttl_seconds),
            ("retrieval_ttl_seconds", self.retrieval_ttl_seconds),
            ("answer_ttl_seconds", self.answer_ttl_seconds),
            ("negative_ttl_seconds", self.negative_ttl_seconds),
            ("stampede_lock_ttl_seconds", self.stampede_lock_ttl_seconds),
            ("stampede_poll_initial_ms", self.stampede_poll_initial_ms),
            ("provider_timeout_ms", self.provider_timeout_ms),
        ] {
            if value == 0 {
                return Err(invalid(key, value));
            }
        }

        if self.negative_ttl_seconds >= self.retrieval_ttl_seconds {
            return Err(ConfigError::InvalidValue {
                key: "negative_ttl_seconds".to_string(),
                value: format!(
                    "{} (must be shorter than retrieval_ttl_seconds = {})",
                    self.negative_ttl_seconds, self.retrieval_ttl_seconds
                ),
            });
        }
        if self.retrieval_top_k == 0 {
            return Err(invalid("retrieval_top_k", self.retrieval_top_k));
        }
        if self.stampede_poll_max_ms < self.stampede_poll_initial_ms {
            return Err(invalid("stampede_poll_max_ms", self.stampede_poll_max_ms));
        }
        if let Some(threshold) = self.semantic_similarity_threshold {
            if !(threshold > 0.0 && threshold <= 1.0) {
                return Err(invalid("semantic_similarity_threshold", threshold));
            }
        }
        if self.answer_cache_required && !self.answer_decoding_params.is_deterministic() {
            return Err(ConfigError::InvalidValue {
                key: "answer_decoding_params".to_string(),
                value: format!(
                    "temperature {} is nondeterministic but answer_cache_required is set",
                    self.answer_decoding_params.temperature
                ),
            });
        }

        Ok(())
    }

    pub fn embedding_ttl(&self) -> Duration {
        Duration::from_secs(self.embedding_ttl_seconds)
    }

    pub fn retrieval_ttl(&self) -> Duration {
        Duration::from_secs(self.retrieval_ttl_seconds)
    }

    pub fn answer_ttl(&self) -> Duration {
        Duration::from_secs(self.answer_ttl_seconds)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl_seconds)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.stampede_lock_ttl_seconds)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn stale_threshold(&self) -> Option<Duration> {
        self.stale_revalidate_threshold_seconds
            .map(Duration::from_secs)
    }
}

fn validate_model_id(key: &str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() || value.contains(':') || value.chars().any(char::is_whitespace) {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    Ok(())
}

fn invalid(key: &str, value: impl std::fmt::Display) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

// ============================================================================
// Store, Provider and Logging Sections
// ============================================================================

/// Cache store connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Which store implementation to use
    pub backend: StoreBackend,

    /// Redis connection URL
    pub redis_url: String,

    /// Upper bound for any single store call
    pub operation_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            operation_timeout_ms: 250,
        }
    }
}

impl StoreConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

/// Supported cache store backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
}

impl std::str::FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            _ => Err(ConfigError::InvalidValue {
                key: "STRATA_STORE_BACKEND".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Which provider family to use
    pub provider: LlmProvider,

    /// OpenAI API key
    pub openai_api_key: Option<String>,

    /// OpenAI API base URL (for Azure or compatible APIs)
    pub openai_base_url: Option<String>,

    /// Output dimension of the embedding model
    pub embedding_dimension: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Local,
            openai_api_key: None,
            openai_base_url: None,
            embedding_dimension: 1536, // OpenAI text-embedding-3-small
        }
    }
}

/// Supported provider families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// OpenAI or any API-compatible server
    OpenAI,
    /// Offline hashing embedder, in-memory index and extractive answers
    Local,
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "local" => Ok(Self::Local),
            _ => Err(ConfigError::InvalidValue {
                key: "LLM_PROVIDER".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// JSON format for logs
    pub json_format: bool,

    /// Include file/line in logs
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_location: false,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Unknown pipeline option: {0}")]
    UnknownOption(String),

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}
