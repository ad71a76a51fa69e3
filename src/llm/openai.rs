//! OpenAI LLM client implementation.
//!
//! Implements the LlmClient trait for OpenAI's chat completions API.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{QueryTalkError, Result};
use crate::llm::types::{prompt_chars, Message};
use crate::llm::LlmClient;

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// OpenAI API base URL.
const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Maximum number of retry attempts for transient errors.
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff (milliseconds).
const RETRY_BASE_DELAY_MS: u64 = 1000;

/// OpenAI client configuration.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// API key for authentication.
    pub api_key: String,
    /// Model to use (e.g., "gpt-4o").
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Nucleus sampling parameter.
    pub top_p: f32,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl OpenAiConfig {
    /// Creates a new config with the given API key and model.
    ///
    /// Sampling defaults to deterministic output (temperature 0, top_p 0.9).
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            temperature: 0.0,
            top_p: 0.9,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Sets the sampling parameters.
    pub fn with_sampling(mut self, temperature: f32, top_p: f32) -> Self {
        self.temperature = temperature;
        self.top_p = top_p;
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

/// OpenAI LLM client.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    config: OpenAiConfig,
    client: Client,
}

impl OpenAiClient {
    /// Creates a new OpenAI client with the given configuration.
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| QueryTalkError::upstream(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    /// Converts internal messages to OpenAI API format.
    fn convert_messages(messages: &[Message]) -> Vec<OpenAiMessage> {
        messages
            .iter()
            .map(|m| OpenAiMessage {
                role: m.role.as_str().to_string(),
                content: m.content.clone(),
            })
            .collect()
    }

    /// Parses an API error response and returns (error, is_retryable).
    fn parse_error(status: reqwest::StatusCode, body: &str) -> (QueryTalkError, bool) {
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return (
                QueryTalkError::upstream("Authentication failed. Check your OPENAI_API_KEY."),
                false,
            );
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return (
                QueryTalkError::upstream("Rate limited. Please wait and try again."),
                true,
            );
        }

        let is_retryable = status.is_server_error();

        if let Ok(error_response) = serde_json::from_str::<OpenAiErrorResponse>(body) {
            return (
                QueryTalkError::upstream(format!(
                    "OpenAI API error: {}",
                    error_response.error.message
                )),
                is_retryable,
            );
        }

        (
            QueryTalkError::upstream(format!("OpenAI API error ({}): {}", status, body)),
            is_retryable,
        )
    }

    /// Maps a transport error and reports whether it is retryable.
    fn map_request_error(error: &reqwest::Error) -> (QueryTalkError, bool) {
        if error.is_timeout() {
            (
                QueryTalkError::upstream_unavailable("Request to OpenAI timed out"),
                true,
            )
        } else if error.is_connect() {
            (
                QueryTalkError::upstream_unavailable(
                    "Failed to connect to OpenAI API. Check your network.",
                ),
                true,
            )
        } else {
            (
                QueryTalkError::upstream(format!("Request failed: {}", error)),
                false,
            )
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, messages: &[Message]) -> Result<String> {
        let request = OpenAiRequest {
            model: self.config.model.clone(),
            messages: Self::convert_messages(messages),
            temperature: self.config.temperature,
            top_p: self.config.top_p,
        };

        let mut last_error = QueryTalkError::upstream("No request was sent to OpenAI");
        let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);

        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            debug!(
                attempt,
                model = %self.config.model,
                prompt_chars = prompt_chars(messages),
                "OpenAI API request"
            );

            let result = self
                .client
                .post(OPENAI_API_URL)
                .bearer_auth(&self.config.api_key)
                .json(&request)
                .send()
                .await;

            let is_retryable = match result {
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.map_err(|e| {
                        QueryTalkError::upstream(format!("Failed to read response: {}", e))
                    })?;

                    if status.is_success() {
                        let response: OpenAiResponse =
                            serde_json::from_str(&body).map_err(|e| {
                                QueryTalkError::upstream(format!("Failed to parse response: {}", e))
                            })?;

                        return response
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|c| c.message.content)
                            .ok_or_else(|| QueryTalkError::upstream("No response from OpenAI"));
                    }

                    let (error, is_retryable) = Self::parse_error(status, &body);
                    last_error = error;
                    is_retryable
                }
                Err(e) => {
                    let (error, is_retryable) = Self::map_request_error(&e);
                    last_error = error;
                    is_retryable
                }
            };

            if !is_retryable || attempt >= MAX_RETRY_ATTEMPTS {
                break;
            }

            warn!(
                "OpenAI API request failed (attempt {}), retrying in {:?}: {}",
                attempt, delay, last_error
            );
            tokio::time::sleep(delay).await;
            delay *= 2;
        }

        Err(last_error)
    }
}

// OpenAI API types

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    temperature: f32,
    top_p: f32,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorResponse {
    error: OpenAiError,
}

#[derive(Debug, Deserialize)]
struct OpenAiError {
    message: String,
}
