//! Anthropic Messages API client
//!
//! Streams completions over SSE, surfaces rate limits with their retry
//! hint, and honors the cancellation handle between stream events.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::LlmConfig;

use super::client::{
    CancelHandle, ChatMessage, CompletionRequest, CompletionResponse, LlmClient, LlmError, Role,
    TokenSink, ToolCall,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API client
pub struct AnthropicClient {
    model: String,
    api_key: String,
    base_url: String,
    http: Client,
    max_tokens: u32,
    timeout: Duration,
}

impl AnthropicClient {
    /// Create a client from configuration; the key comes from the
    /// environment variable the config names.
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| LlmError::Api {
            status: 0,
            message: format!("environment variable {} not set", config.api_key_env),
        })?;

        let timeout = Duration::from_millis(config.timeout_ms);
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Stream(e.to_string()))?;

        Ok(Self {
            model: config.model.clone(),
            api_key,
            base_url: config.base_url.clone(),
            http,
            max_tokens: config.max_tokens,
            timeout,
        })
    }

    fn build_body(&self, request: &CompletionRequest) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": role_name(m),
                    "content": m.content,
                })
            })
            .collect();

        let mut body = serde_json::json!({
            "model": self.model,
            "max_tokens": request.max_tokens.min(self.max_tokens),
            "system": request.system,
            "messages": messages,
            "stream": true,
        });

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.input_schema,
                        })
                    })
                    .collect::<Vec<_>>()
            );
        }
        body
    }
}

fn role_name(message: &ChatMessage) -> &'static str {
    match message.role {
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// SSE payloads we care about; everything else is skipped
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamPayload {
    #[serde(rename = "message_start")]
    MessageStart { message: MessageStart },
    #[serde(rename = "content_block_start")]
    ContentBlockStart { content_block: ContentBlockStart },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: Delta },
    #[serde(rename = "message_delta")]
    MessageDelta {
        delta: StopDelta,
        usage: Option<DeltaUsage>,
    },
    #[serde(rename = "error")]
    ApiError { error: ErrorBody },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlockStart {
    #[serde(rename = "text")]
    Text {},
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum Delta {
    #[serde(rename = "text_delta")]
    Text { text: String },
    #[serde(rename = "input_json_delta")]
    InputJson { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StopDelta {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeltaUsage {
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: &CancelHandle,
        sink: Option<TokenSink>,
    ) -> Result<CompletionResponse, LlmError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_body(&request);

        let request_builder = self
            .http
            .post(url)
            .header("x-api-key", self.api_key.clone())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body);

        let mut source = EventSource::new(request_builder).map_err(|e| LlmError::Stream(e.to_string()))?;

        let mut response = CompletionResponse::default();
        let mut open_tool: Option<(String, String, String)> = None; // id, name, json

        let deadline = tokio::time::Instant::now() + self.timeout;

        loop {
            let event = tokio::select! {
                event = source.next() => event,
                _ = cancel.cancelled() => {
                    source.close();
                    return Err(LlmError::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    source.close();
                    return Err(LlmError::Timeout(self.timeout.as_millis() as u64));
                }
            };

            let Some(event) = event else {
                break; // stream ended
            };

            match event {
                Ok(Event::Open) => debug!("Stream opened"),
                Ok(Event::Message(message)) => {
                    if message.data == "[DONE]" {
                        break;
                    }
                    let payload: StreamPayload = match serde_json::from_str(&message.data) {
                        Ok(p) => p,
                        Err(e) => {
                            debug!(error = %e, "Skipping unparseable stream payload");
                            continue;
                        }
                    };
                    match payload {
                        StreamPayload::MessageStart { message } => {
                            response.input_tokens = message.usage.input_tokens;
                        }
                        StreamPayload::ContentBlockStart { content_block } => {
                            if let ContentBlockStart::ToolUse { id, name } = content_block {
                                finish_tool(&mut open_tool, &mut response);
                                open_tool = Some((id, name, String::new()));
                            }
                        }
                        StreamPayload::ContentBlockDelta { delta } => match delta {
                            Delta::Text { text } => {
                                if let Some(ref sink) = sink {
                                    sink(&text);
                                }
                                response.content.push_str(&text);
                            }
                            Delta::InputJson { partial_json } => {
                                if let Some((_, _, ref mut json)) = open_tool {
                                    json.push_str(&partial_json);
                                }
                            }
                            Delta::Other => {}
                        },
                        StreamPayload::MessageDelta { delta, usage } => {
                            if let Some(reason) = delta.stop_reason {
                                response.stop_reason = reason;
                            }
                            if let Some(usage) = usage {
                                response.output_tokens = usage.output_tokens;
                            }
                        }
                        StreamPayload::ApiError { error } => {
                            source.close();
                            if error.message.contains("prompt is too long") {
                                return Err(LlmError::ContextOverflow);
                            }
                            return Err(LlmError::Api {
                                status: 0,
                                message: error.message,
                            });
                        }
                        StreamPayload::Other => {}
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(reqwest_eventsource::Error::InvalidStatusCode(status, response_body)) => {
                    source.close();
                    if status.as_u16() == 429 {
                        let retry_after_ms = response_body
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|s| s.parse::<u64>().ok())
                            .map(|s| s * 1_000)
                            .unwrap_or(60_000);
                        return Err(LlmError::RateLimited { retry_after_ms });
                    }
                    return Err(LlmError::Api {
                        status: status.as_u16(),
                        message: "request rejected".to_string(),
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Stream error");
                    source.close();
                    return Err(LlmError::Stream(e.to_string()));
                }
            }
        }

        finish_tool(&mut open_tool, &mut response);
        Ok(response)
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}

fn finish_tool(open_tool: &mut Option<(String, String, String)>, response: &mut CompletionResponse) {
    if let Some((id, name, json)) = open_tool.take() {
        let arguments = serde_json::from_str(&json).unwrap_or(serde_json::Value::Null);
        response.tool_calls.push(ToolCall { id, name, arguments });
    }
}
