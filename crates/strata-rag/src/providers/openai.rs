//! OpenAI-compatible provider clients
//!
//! Both clients speak the OpenAI REST API and work against any compatible
//! server through `openai_base_url`.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use strata_core::{
    ConfigError, DecodingParams, EmbeddingProvider, GenerationRequest, LlmClient, LlmConfig,
    ProviderKind, Result, StrataError,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

fn api_key(config: &LlmConfig) -> Result<String> {
    config
        .openai_api_key
        .clone()
        .ok_or_else(|| ConfigError::MissingRequired("OPENAI_API_KEY".to_string()).into())
}

fn base_url(config: &LlmConfig) -> String {
    config
        .openai_base_url
        .clone()
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
}

// ============================================================================
// Embeddings
// ============================================================================

/// OpenAI embedding API client
pub struct OpenAiEmbedding {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    dimension: usize,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a str,
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl OpenAiEmbedding {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, dimension: usize) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.into(),
            dimension,
        }
    }

    /// Create from config; the model is the pipeline's embedding model id
    pub fn from_config(config: &LlmConfig, model: impl Into<String>) -> Result<Self> {
        Ok(Self::new(api_key(config)?, model, config.embedding_dimension)
            .with_base_url(base_url(config)))
    }

    /// Set custom base URL (for Azure or compatible APIs)
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            input: text,
            model: &self.model,
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                StrataError::provider(ProviderKind::Embedding, format!("Request failed: {e}"))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(StrataError::provider(
                ProviderKind::Embedding,
                format!("HTTP {status}: {error_text}"),
            ));
        }

        let result: EmbeddingResponse = response.json().await.map_err(|e| {
            StrataError::provider(
                ProviderKind::Embedding,
                format!("Failed to parse response: {e}"),
            )
        })?;

        result
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| StrataError::provider(ProviderKind::Embedding, "No embedding returned"))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "openai-embedding"
    }
}

// ============================================================================
// Chat completions
// ============================================================================

/// OpenAI chat completion client
pub struct OpenAiChat {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

impl<'a> ChatRequest<'a> {
    fn new(model: &'a str, prompt: &'a str, params: &DecodingParams) -> Self {
        Self {
            model,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            seed: params.seed,
        }
    }
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl OpenAiChat {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.into(),
        }
    }

    /// Create from config; the model is the pipeline's answer model id
    pub fn from_config(config: &LlmConfig, model: impl Into<String>) -> Result<Self> {
        Ok(Self::new(api_key(config)?, model).with_base_url(base_url(config)))
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[async_trait]
impl LlmClient for OpenAiChat {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let body = ChatRequest::new(&self.model, &request.prompt, &request.params);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| StrataError::provider(ProviderKind::Llm, format!("Request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(StrataError::provider(
                ProviderKind::Llm,
                format!("HTTP {status}: {error_text}"),
            ));
        }

        let result: ChatResponse = response.json().await.map_err(|e| {
            StrataError::provider(ProviderKind::Llm, format!("Failed to parse response: {e}"))
        })?;

        result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| StrataError::provider(ProviderKind::Llm, "No response generated"))
    }

    fn name(&self) -> &str {
        "openai-chat"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_is_a_config_error() {
        let err = OpenAiChat::from_config(&LlmConfig::default(), "gpt-4o-mini")
            .err()
            .unwrap();
        assert!(err.is_usage());
    }

    #[test]
    fn test_base_url_from_config() {
        let config = LlmConfig {
            openai_api_key: Some("sk-test".into()),
            openai_base_url: Some("http://localhost:8000/v1".into()),
            embedding_dimension: 768,
            ..Default::default()
        };
        let embedding = OpenAiEmbedding::from_config(&config, "nomic-embed-text").unwrap();
        assert_eq!(embedding.base_url, "http://localhost:8000/v1");
        assert_eq!(embedding.dimension(), 768);
    }

    #[test]
    fn test_chat_request_carries_decoding_params() {
        let params = DecodingParams {
            seed: Some(7),
            ..DecodingParams::greedy(128)
        };
        let body = serde_json::to_value(ChatRequest::new("gpt-4o-mini", "hi", &params)).unwrap();

        assert_eq!(body["max_tokens"], 128);
        assert_eq!(body["temperature"], 0.0);
        assert_eq!(body["seed"], 7);
        assert_eq!(body["messages"][0]["content"], "hi");
    }
}
