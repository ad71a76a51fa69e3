//! Mock LLM clients for testing.
//!
//! Provides deterministic, scripted responses based on prompt patterns.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::{QueryTalkError, Result};
use crate::llm::types::Message;
use crate::llm::LlmClient;

/// A pattern with the responses it yields, in order.
///
/// The last response repeats once the queue is down to one element.
#[derive(Debug)]
struct Script {
    pattern: String,
    responses: VecDeque<String>,
}

/// Mock LLM client that returns canned responses based on prompt patterns.
///
/// A pattern matches when any message of the prompt contains it
/// (case-insensitive). Scripts are checked in the order they were added, so
/// more specific patterns go first. Every prompt is recorded for assertions.
#[derive(Debug, Default)]
pub struct MockLlmClient {
    scripts: Mutex<Vec<Script>>,
    fallback: Option<String>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl MockLlmClient {
    /// Creates a new mock client with no scripted responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a mock that walks the whole data branch with fixed answers.
    ///
    /// Used by the `mock` provider so the CLI can be exercised offline.
    pub fn demo() -> Self {
        Self::new()
            .with_response("task: classify", "1")
            .with_response(
                "task: analyze",
                "- 의도: 데이터 조회\n- 조회 필요 테이블: orders (주문 내역)",
            )
            .with_response("task: clarify", "종료")
            .with_response("task: write sql", "```sql\nSELECT COUNT(*) AS orders FROM orders;\n```")
            .with_response("task: answer", "Here is what the query returned.")
            .with_fallback("Hello! Ask me anything about your data.")
    }

    /// Adds a response for prompts containing `pattern`.
    pub fn with_response(self, pattern: impl Into<String>, response: impl Into<String>) -> Self {
        self.with_responses(pattern, [response.into()])
    }

    /// Adds a sequence of responses for prompts containing `pattern`.
    ///
    /// Each matching call consumes one response; the last one repeats.
    pub fn with_responses<I, S>(self, pattern: impl Into<String>, responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let script = Script {
            pattern: pattern.into().to_lowercase(),
            responses: responses.into_iter().map(Into::into).collect(),
        };
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(script);
        self
    }

    /// Sets the response for prompts no script matches.
    pub fn with_fallback(mut self, response: impl Into<String>) -> Self {
        self.fallback = Some(response.into());
        self
    }

    /// Returns the number of completions requested so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Returns every prompt received so far.
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Returns the number of prompts that contained `pattern`.
    pub fn calls_matching(&self, pattern: &str) -> usize {
        let pattern = pattern.to_lowercase();
        self.calls()
            .iter()
            .filter(|messages| Self::prompt_text(messages).contains(&pattern))
            .count()
    }

    fn prompt_text(messages: &[Message]) -> String {
        messages
            .iter()
            .map(|m| m.content.to_lowercase())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn mock_response(&self, messages: &[Message]) -> Option<String> {
        let text = Self::prompt_text(messages);
        let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());

        for script in scripts.iter_mut() {
            if !text.contains(&script.pattern) {
                continue;
            }
            return if script.responses.len() > 1 {
                script.responses.pop_front()
            } else {
                script.responses.front().cloned()
            };
        }

        self.fallback.clone()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(messages.to_vec());

        self.mock_response(messages)
            .ok_or_else(|| QueryTalkError::upstream("Mock client has no response for this prompt"))
    }
}

/// LLM client that fails every call with a fixed error.
#[derive(Debug)]
pub struct FailingLlmClient {
    error: QueryTalkError,
    calls: Mutex<usize>,
}

impl FailingLlmClient {
    /// Creates a client failing with the given error.
    pub fn new(error: QueryTalkError) -> Self {
        Self {
            error,
            calls: Mutex::new(0),
        }
    }

    /// Creates a client that behaves like an unreachable gateway.
    pub fn unavailable() -> Self {
        Self::new(QueryTalkError::upstream_unavailable("connection refused"))
    }

    /// Returns the number of completions attempted.
    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LlmClient for FailingLlmClient {
    async fn complete(&self, _messages: &[Message]) -> Result<String> {
        *self.calls.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Err(self.error.clone())
    }
}
