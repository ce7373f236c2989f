//! Messages API client
//!
//! Stateless adapter between the agent loop and the model provider: one
//! [`LlmRequest`] becomes exactly one HTTP POST, the reply is parsed into an
//! [`LlmResponse`]. No retries happen here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::models::{Message, ToolCall, ToolInput};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("API error: {status} - {body}")]
    Status { status: u16, body: String },
    #[error("Malformed response ({reason}): {body}")]
    Malformed { reason: String, body: String },
    #[error("Provider API key is not configured")]
    NotConfigured,
}

/// Tool declaration sent with a request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: String,
    pub max_tokens: u32,
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LlmResponse {
    /// Text blocks joined with newlines
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub stop_reason: Option<String>,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn send(&self, request: LlmRequest) -> Result<LlmResponse, ProviderError>;
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: Vec<WireBlock<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock<'a> {
    Text {
        text: &'a str,
    },
    ToolUse {
        id: &'a str,
        name: &'a str,
        input: &'a ToolInput,
    },
    ToolResult {
        tool_use_id: &'a str,
        content: &'a str,
        #[serde(skip_serializing_if = "is_false")]
        is_error: bool,
    },
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    input_tokens: i32,
    #[serde(default)]
    output_tokens: i32,
}

fn message_blocks(message: &Message) -> Vec<WireBlock<'_>> {
    let mut blocks = Vec::new();

    if let Some(text) = message.content.as_deref().filter(|t| !t.is_empty()) {
        blocks.push(WireBlock::Text { text });
    }
    for call in &message.tool_calls {
        blocks.push(WireBlock::ToolUse {
            id: &call.id,
            name: &call.name,
            input: &call.input,
        });
    }
    for result in &message.tool_results {
        blocks.push(WireBlock::ToolResult {
            tool_use_id: &result.tool_call_id,
            content: &result.content,
            is_error: result.is_error,
        });
    }

    blocks
}

/// Serialize a request into the provider's JSON body
pub fn build_request_body(request: &LlmRequest) -> Value {
    let wire = WireRequest {
        model: &request.model,
        max_tokens: request.max_tokens,
        system: request.system.as_deref(),
        // A stored empty reply has no blocks and the provider rejects empty turns
        messages: request
            .messages
            .iter()
            .map(|m| WireMessage {
                role: m.role.as_str(),
                content: message_blocks(m),
            })
            .filter(|m| !m.content.is_empty())
            .collect(),
        tools: (!request.tools.is_empty()).then_some(request.tools.as_slice()),
    };

    // Plain data with string keys
    serde_json::to_value(&wire).unwrap_or(Value::Null)
}

/// Parse a successful response body
pub fn parse_response_body(body: &str) -> Result<LlmResponse, ProviderError> {
    let wire: WireResponse = serde_json::from_str(body).map_err(|e| ProviderError::Malformed {
        reason: e.to_string(),
        body: body.to_string(),
    })?;

    let mut texts = Vec::new();
    let mut tool_calls = Vec::new();

    for block in wire.content {
        match block {
            ResponseBlock::Text { text } => texts.push(text),
            ResponseBlock::ToolUse { id, name, input } => {
                let input = match input {
                    Value::Object(map) => map,
                    _ => ToolInput::new(),
                };
                tool_calls.push(ToolCall { id, name, input });
            }
            ResponseBlock::Other => {}
        }
    }

    let usage = wire.usage.unwrap_or_default();

    Ok(LlmResponse {
        content: texts.join("\n"),
        tool_calls,
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        stop_reason: wire.stop_reason,
    })
}

// ============================================================================
// Client
// ============================================================================

#[derive(Clone)]
pub struct AnthropicClient {
    client: reqwest::Client,
    api_key: String,
    api_url: String,
}

impl fmt::Debug for AnthropicClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnthropicClient")
            .field("api_url", &self.api_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl AnthropicClient {
    pub fn new(
        api_key: impl Into<String>,
        api_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ProviderError::NotConfigured);
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            api_key,
            api_url: api_url.into(),
        })
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn send(&self, request: LlmRequest) -> Result<LlmResponse, ProviderError> {
        let body = build_request_body(&request);
        debug!(
            "Sending {} messages with {} tools to {}",
            request.messages.len(),
            request.tools.len(),
            request.model
        );

        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed = parse_response_body(&text)?;
        debug!(
            "Model replied: {} tool calls, {} in / {} out tokens, stop_reason={:?}",
            parsed.tool_calls.len(),
            parsed.input_tokens,
            parsed.output_tokens,
            parsed.stop_reason
        );
        Ok(parsed)
    }
}
