use async_trait::async_trait;

pub mod client;

pub use client::LlmClient;

/// One single-turn completion: a system prompt, one user message.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    /// Ask the endpoint for a JSON object response.
    pub json: bool,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> anyhow::Result<String>;
}
