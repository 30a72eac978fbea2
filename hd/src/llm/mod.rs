//! LLM boundary: provider-agnostic client trait and the Anthropic impl

pub mod anthropic;
pub mod client;

pub use anthropic::AnthropicClient;
pub use client::{
    CancelHandle, ChatMessage, CompletionRequest, CompletionResponse, LlmClient, LlmError, Role,
    TokenSink, ToolCall, ToolSpec,
};

use crate::config::LlmConfig;

/// Build a client for the configured provider
pub fn create_client(config: &LlmConfig) -> Result<Box<dyn LlmClient>, LlmError> {
    match config.provider.as_str() {
        "anthropic" => Ok(Box::new(AnthropicClient::from_config(config)?)),
        other => Err(LlmError::Api {
            status: 0,
            message: format!("unknown llm provider: {other}"),
        }),
    }
}
