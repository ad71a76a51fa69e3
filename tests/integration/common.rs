//! Test doubles shared by the integration tests.

use async_trait::async_trait;
use querytalk::error::Result;
use querytalk::llm::{LlmClient, Message, MockLlmClient};

/// Hands control back to the runtime before every completion, so turns run
/// by separate orchestrators interleave like separate processes would.
pub struct YieldingLlm(pub MockLlmClient);

#[async_trait]
impl LlmClient for YieldingLlm {
    async fn complete(&self, messages: &[Message]) -> Result<String> {
        tokio::task::yield_now().await;
        self.0.complete(messages).await
    }
}
