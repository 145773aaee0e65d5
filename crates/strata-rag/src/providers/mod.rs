//! Provider implementations
//!
//! | Family | Embedding | LLM |
//! |--------|-----------|-----|
//! | `openai` | [`OpenAiEmbedding`] | [`OpenAiChat`] |
//! | `local` | [`HashingEmbedder`] | [`ExtractiveLlm`] |
//!
//! Both families retrieve through [`InMemoryIndex`].

pub mod local;
pub mod openai;

pub use local::{ExtractiveLlm, HashingEmbedder, InMemoryIndex, HASHING_DIMENSION};
pub use openai::{OpenAiChat, OpenAiEmbedding};

use std::sync::Arc;
use strata_core::{
    config::LlmProvider, EmbeddingProvider, LlmClient, LlmConfig, PipelineConfig, Result,
};

/// Create an embedding provider from config
pub fn create_embedder(
    llm: &LlmConfig,
    pipeline: &PipelineConfig,
) -> Result<Arc<dyn EmbeddingProvider>> {
    match llm.provider {
        LlmProvider::OpenAI => Ok(Arc::new(OpenAiEmbedding::from_config(
            llm,
            pipeline.embedding_model_id.clone(),
        )?)),
        LlmProvider::Local => Ok(Arc::new(HashingEmbedder::new())),
    }
}

/// Create an LLM client from config
pub fn create_llm_client(llm: &LlmConfig, pipeline: &PipelineConfig) -> Result<Arc<dyn LlmClient>> {
    match llm.provider {
        LlmProvider::OpenAI => Ok(Arc::new(OpenAiChat::from_config(
            llm,
            pipeline.answer_model_id.clone(),
        )?)),
        LlmProvider::Local => Ok(Arc::new(ExtractiveLlm)),
    }
}
