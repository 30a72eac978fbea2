//! LLM client contract
//!
//! The daemon treats the model as a streaming text-in/text-out service with
//! tool calling. Everything provider-specific lives behind [`LlmClient`];
//! the core only needs completion, token accounting, and a cancellation
//! handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// Errors from the model boundary
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    #[error("rate limited; retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("api error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("context window exceeded")]
    ContextOverflow,

    #[error("cancelled")]
    Cancelled,
}

impl LlmError {
    /// Transient errors get retried by the caller with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::RateLimited { .. } | Self::Stream(_))
    }
}

/// Message role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A tool the model may call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A tool call the model requested
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One completion request
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub tools: Vec<ToolSpec>,
    /// Deterministic seeding where the provider supports it
    pub seed: Option<u64>,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            messages: Vec::new(),
            max_tokens: 4096,
            tools: Vec::new(),
            seed: None,
        }
    }

    pub fn with_message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// The assembled result of a completion
#[derive(Debug, Clone, Default)]
pub struct CompletionResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub stop_reason: String,
}

/// Cooperative cancellation for an in-flight completion
#[derive(Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves when cancel() is called; checks the flag first so a cancel
    /// that raced the await is not lost.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Streaming token sink; `None` means the caller does not care
pub type TokenSink = Box<dyn Fn(&str) + Send + Sync>;

/// The provider-agnostic client surface
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run one completion, streaming tokens into `sink` as they arrive
    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: &CancelHandle,
        sink: Option<TokenSink>,
    ) -> Result<CompletionResponse, LlmError>;

    /// Provider name for logs
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(LlmError::Timeout(1000).is_retryable());
        assert!(LlmError::RateLimited { retry_after_ms: 500 }.is_retryable());
        assert!(!LlmError::ContextOverflow.is_retryable());
        assert!(!LlmError::Cancelled.is_retryable());
        assert!(
            !LlmError::Api {
                status: 400,
                message: "bad request".to_string()
            }
            .is_retryable()
        );
    }

    #[tokio::test]
    async fn test_cancel_handle_races() {
        let handle = CancelHandle::new();
        handle.cancel();
        // A cancel that happened before the await still resolves
        handle.cancelled().await;
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_request_builder() {
        let request = CompletionRequest::new("you are a builder")
            .with_message(ChatMessage::user("implement the task"))
            .with_max_tokens(1024);
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.max_tokens, 1024);
    }
}
