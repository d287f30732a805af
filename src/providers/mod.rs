//! Language model providers

pub mod openai_compat;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::conversation::{Message, ToolCall};
use crate::tools::ToolDefinition;

pub use openai_compat::{OpenAICompatConfig, OpenAICompatProvider};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Stream interrupted: {0}")]
    Stream(String),
}

/// A non-streamed model reply
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

/// Incremental text fragments of a streamed reply
pub type FragmentStream = BoxStream<'static, Result<String, ProviderError>>;

/// What the chat engine needs from a model
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Model identifier, for logs and health
    fn model_name(&self) -> &str;

    /// One non-streamed completion with `tools` offered and the choice left
    /// to the model
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<Completion, ProviderError>;

    /// A streamed completion with no tools offered
    async fn stream(&self, messages: &[Message]) -> Result<FragmentStream, ProviderError>;
}
