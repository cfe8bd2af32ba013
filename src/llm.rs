use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;

use crate::config::{ModelConfig, ModelEndpoint};
use crate::error::ConfigError;
use crate::models::Message;
use crate::ollama::{OllamaClient, OllamaEmbedder, OllamaModel};
use crate::openai::{OpenAiChatModel, OpenAiClient, OpenAiCompletionModel};

pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<CompletionChunk>> + Send>>;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("embedder returned no vector for query"))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, messages: &[Message]) -> Result<Message>;

    async fn stream(&self, messages: &[Message]) -> Result<TextStream>;

    async fn invoke_with_tools(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<Message> {
        let _ = (messages, tools);
        anyhow::bail!("model {} cannot bind tools", self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompletionChunk {
    Text(String),
    Done { tokens: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub tokens: usize,
}

#[async_trait]
pub trait CompletionModel: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(
        &self,
        prompt: &str,
        max_tokens: Option<usize>,
        stop: &[String],
    ) -> Result<Completion>;

    async fn complete_stream(
        &self,
        prompt: &str,
        max_tokens: Option<usize>,
        stop: &[String],
    ) -> Result<CompletionStream>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Ollama,
    OpenAi,
    OpenAiCompletion,
}

impl FromStr for Provider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err(ConfigError::MissingProvider),
            "ollama" => Ok(Provider::Ollama),
            "openai" => Ok(Provider::OpenAi),
            "openai_completion" => Ok(Provider::OpenAiCompletion),
            other => Err(ConfigError::UnknownProvider(other.to_string())),
        }
    }
}

impl Provider {
    pub fn supports_tools(self) -> bool {
        matches!(self, Provider::Ollama | Provider::OpenAi)
    }

    pub fn supports_completion(self) -> bool {
        matches!(self, Provider::Ollama | Provider::OpenAiCompletion)
    }
}

pub fn check_provider(provider: &str, model: &str) -> Result<Provider, ConfigError> {
    let provider = provider.parse::<Provider>()?;
    if model.trim().is_empty() {
        return Err(ConfigError::MissingModelName);
    }
    Ok(provider)
}

pub fn supports_tools(provider: &str) -> bool {
    provider
        .parse::<Provider>()
        .map(Provider::supports_tools)
        .unwrap_or(false)
}

pub fn supports_completion(provider: &str) -> bool {
    provider
        .parse::<Provider>()
        .map(Provider::supports_completion)
        .unwrap_or(false)
}

pub fn build_chat_model(
    endpoint: &ModelEndpoint,
    models: &ModelConfig,
) -> Result<Arc<dyn ChatModel>, ConfigError> {
    let provider = check_provider(&endpoint.provider, &endpoint.model)?;
    let model: Arc<dyn ChatModel> = match provider {
        Provider::Ollama => Arc::new(OllamaModel::new(
            OllamaClient::new(endpoint.base_url.clone()),
            endpoint.model.clone(),
            models.seed,
        )),
        Provider::OpenAi => Arc::new(OpenAiChatModel::new(
            OpenAiClient::new(endpoint.base_url.clone(), models.api_key.clone()),
            endpoint.model.clone(),
            models.seed,
        )),
        Provider::OpenAiCompletion => Arc::new(OpenAiCompletionModel::new(
            OpenAiClient::new(endpoint.base_url.clone(), models.api_key.clone()),
            endpoint.model.clone(),
            models.seed,
        )),
    };
    Ok(model)
}

pub fn build_completion_model(
    endpoint: &ModelEndpoint,
    models: &ModelConfig,
) -> Result<Arc<dyn CompletionModel>, ConfigError> {
    let provider = check_provider(&endpoint.provider, &endpoint.model)?;
    let model: Arc<dyn CompletionModel> = match provider {
        Provider::Ollama => Arc::new(OllamaModel::new(
            OllamaClient::new(endpoint.base_url.clone()),
            endpoint.model.clone(),
            models.seed,
        )),
        Provider::OpenAiCompletion => Arc::new(OpenAiCompletionModel::new(
            OpenAiClient::new(endpoint.base_url.clone(), models.api_key.clone()),
            endpoint.model.clone(),
            models.seed,
        )),
        Provider::OpenAi => {
            return Err(ConfigError::BudgetForcingUnsupported(
                endpoint.provider.clone(),
            ))
        }
    };
    Ok(model)
}

pub fn build_embedder(models: &ModelConfig) -> Arc<dyn Embedder> {
    Arc::new(OllamaEmbedder::new(
        OllamaClient::new(models.embedding_base_url.clone()),
        models.embedding_model.clone(),
    ))
}

pub fn estimate_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_validation_matches_factory_rules() {
        assert!(matches!(
            check_provider("", "m"),
            Err(ConfigError::MissingProvider)
        ));
        assert!(matches!(
            check_provider("ollama", "  "),
            Err(ConfigError::MissingModelName)
        ));
        assert!(matches!(
            check_provider("anthropic", "m"),
            Err(ConfigError::UnknownProvider(_))
        ));
        assert_eq!(check_provider("openai", "gpt").unwrap(), Provider::OpenAi);
    }

    #[test]
    fn capability_table() {
        assert!(supports_tools("ollama"));
        assert!(supports_tools("openai"));
        assert!(!supports_tools("openai_completion"));
        assert!(supports_completion("openai_completion"));
        assert!(!supports_completion("openai"));
        assert!(!supports_completion("nonsense"));
    }

    #[test]
    fn completion_factory_rejects_chat_only_backend() {
        let models = ModelConfig {
            clinical: ModelEndpoint {
                provider: "openai".to_string(),
                model: "gpt".to_string(),
                base_url: "http://localhost".to_string(),
            },
            agent: ModelEndpoint {
                provider: "openai".to_string(),
                model: "gpt".to_string(),
                base_url: "http://localhost".to_string(),
            },
            rerank: ModelEndpoint {
                provider: "openai".to_string(),
                model: "gpt".to_string(),
                base_url: "http://localhost".to_string(),
            },
            embedding_model: "e".to_string(),
            embedding_base_url: "http://localhost".to_string(),
            api_key: None,
            seed: None,
        };
        let err = build_completion_model(&models.clinical, &models)
            .err()
            .expect("chat-only provider must be rejected");
        assert!(matches!(err, ConfigError::BudgetForcingUnsupported(_)));
    }
}
