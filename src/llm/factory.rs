//! LLM client factory.
//!
//! Centralizes provider-specific logic for creating LLM clients.

use std::sync::Arc;

use crate::config::LlmConfig;
use crate::error::{QueryTalkError, Result};
use crate::llm::{
    LlmClient, LlmProvider, MockLlmClient, OllamaClient, OllamaConfig, OpenAiClient,
    OpenAiConfig,
};

/// Creates an LLM client from the `[llm]` configuration section.
///
/// If `api_key` is provided, it takes precedence over `OPENAI_API_KEY`.
/// Ollama reads `OLLAMA_URL` when no `base_url` is configured.
pub fn create_client(config: &LlmConfig, api_key: Option<String>) -> Result<Arc<dyn LlmClient>> {
    let provider: LlmProvider = config.provider.parse().map_err(QueryTalkError::config)?;

    match provider {
        LlmProvider::OpenAi => {
            let key = api_key
                .or_else(|| std::env::var("OPENAI_API_KEY").ok())
                .ok_or_else(|| {
                    QueryTalkError::config(
                        "No API key configured. Pass --api-key or set OPENAI_API_KEY.",
                    )
                })?;
            let openai = OpenAiConfig::new(key, &config.model)
                .with_sampling(config.temperature, config.top_p)
                .with_timeout(config.timeout_secs);
            Ok(Arc::new(OpenAiClient::new(openai)?))
        }
        LlmProvider::Ollama => {
            let mut ollama = OllamaConfig::new(&config.model)
                .with_sampling(config.temperature, config.top_p)
                .with_timeout(config.timeout_secs);
            if let Some(url) = config
                .base_url
                .clone()
                .or_else(|| std::env::var("OLLAMA_URL").ok())
            {
                ollama = ollama.with_url(url);
            }
            Ok(Arc::new(OllamaClient::new(ollama)?))
        }
        LlmProvider::Mock => Ok(Arc::new(MockLlmClient::demo())),
    }
}
