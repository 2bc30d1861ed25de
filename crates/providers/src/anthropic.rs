//! Anthropic native provider implementation.
//!
//! Uses Anthropic's Messages API directly with `stream: true`.
//!
//! Features:
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - System prompt as top-level field
//! - Native tool use with `tool_use` / `tool_result` content blocks
//! - SSE events translated one-to-one into [`UpstreamEvent`]s
//! - HTTP 529 and `overloaded_error` payloads surfaced as `ProviderError::Overloaded`

use async_trait::async_trait;
use futures::StreamExt;
use loopwire_core::error::{OVERLOADED_ERROR_TYPE, ProviderError};
use loopwire_core::message::{ContentBlock as TurnBlock, ConversationTurn, Role};
use loopwire_core::provider::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Anthropic native Messages API provider.
pub struct AnthropicProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider.
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            name: "anthropic".into(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            client,
        })
    }

    /// Create with a custom base URL (e.g., for testing or proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Convert turns to Anthropic API format with content blocks.
    ///
    /// Tool turns become `user` messages carrying `tool_result` blocks.
    fn to_api_messages(turns: &[ConversationTurn]) -> Vec<AnthropicMessage> {
        turns
            .iter()
            .filter_map(|turn| {
                let blocks: Vec<ContentBlock> = turn
                    .content
                    .iter()
                    .filter_map(|block| match block {
                        TurnBlock::Text { text } if text.is_empty() => None,
                        TurnBlock::Text { text } => Some(ContentBlock::Text { text: text.clone() }),
                        TurnBlock::ToolInvocation { id, name, input } => {
                            Some(ContentBlock::ToolUse {
                                id: id.clone(),
                                name: name.clone(),
                                input: input.clone(),
                            })
                        }
                        TurnBlock::ToolResult {
                            tool_id,
                            content,
                            is_error,
                        } => Some(ContentBlock::ToolResult {
                            tool_use_id: tool_id.clone(),
                            content: content.clone(),
                            is_error: *is_error,
                        }),
                    })
                    .collect();

                if blocks.is_empty() {
                    return None;
                }

                let role = match turn.role {
                    Role::Assistant => "assistant",
                    Role::User | Role::Tool => "user",
                };

                let single_text = match blocks.as_slice() {
                    [ContentBlock::Text { text }] => Some(text.clone()),
                    _ => None,
                };
                let content = match single_text {
                    Some(text) => AnthropicContent::Text(text),
                    None => AnthropicContent::Blocks(blocks),
                };

                Some(AnthropicMessage {
                    role: role.into(),
                    content,
                })
            })
            .collect()
    }

    /// Convert tool definitions to Anthropic format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<AnthropicTool> {
        tools
            .iter()
            .map(|t| AnthropicTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.parameters.clone(),
            })
            .collect()
    }

    fn request_body(request: &ProviderRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.turns),
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "stream": true,
        });

        if let Some(ref sys) = request.system {
            body["system"] = serde_json::json!(sys);
        }

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }

        body
    }
}

/// Map a non-success HTTP status and body to a provider error.
fn status_error(status: u16, body: String) -> ProviderError {
    let error_type = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v["error"]["type"].as_str().map(str::to_string));

    if status == 529 || error_type.as_deref() == Some(OVERLOADED_ERROR_TYPE) {
        return ProviderError::Overloaded(body);
    }

    match status {
        429 => ProviderError::RateLimited {
            retry_after_secs: 5,
        },
        401 | 403 => ProviderError::AuthenticationFailed("Invalid Anthropic API key".into()),
        _ => ProviderError::ApiError {
            status_code: status,
            message: body,
        },
    }
}

/// Map a failure to get a response at all.
fn send_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(e.to_string())
    } else {
        ProviderError::Network(e.to_string())
    }
}

#[async_trait]
impl loopwire_core::Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(&self, request: ProviderRequest) -> Result<UpstreamStream, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = Self::request_body(&request);

        debug!(provider = "anthropic", model = %request.model, turns = request.turns.len(), "Sending streaming request");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(send_error)?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Anthropic API error");
            return Err(status_error(status, error_body));
        }

        let (tx, rx) = tokio::sync::mpsc::channel(64);

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut lines = SseLineBuffer::default();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                for line in lines.push(&bytes) {
                    let Some(data) = line.strip_prefix("data:") else {
                        // `event:` names duplicate the payload's `type`; comments are noise.
                        continue;
                    };
                    let data = data.trim();
                    if data.is_empty() {
                        continue;
                    }

                    let event: serde_json::Value = match serde_json::from_str(data) {
                        Ok(v) => v,
                        Err(e) => {
                            trace!(error = %e, data = %data, "Ignoring unparseable Anthropic SSE");
                            continue;
                        }
                    };

                    let Some(translated) = translate_event(&event) else {
                        continue;
                    };
                    let terminal = matches!(translated, Ok(UpstreamEvent::MessageStop) | Err(_));
                    if tx.send(translated).await.is_err() || terminal {
                        return;
                    }
                }
            }

            let _ = tx
                .send(Err(ProviderError::StreamInterrupted(
                    "stream ended before message_stop".into(),
                )))
                .await;
        });

        Ok(rx)
    }
}

/// Translate one decoded SSE payload into an upstream event.
///
/// Returns `None` for payloads that carry nothing the runtime acts on
/// (`ping`, unknown event types).
fn translate_event(event: &serde_json::Value) -> Option<Result<UpstreamEvent, ProviderError>> {
    let index = || event["index"].as_u64().unwrap_or(0) as usize;

    let translated = match event["type"].as_str().unwrap_or("") {
        "message_start" => UpstreamEvent::MessageStart {
            usage: parse_usage(&event["message"]["usage"]),
        },
        "content_block_start" => {
            let block = &event["content_block"];
            let start = match block["type"].as_str().unwrap_or("") {
                "text" => BlockStart::Text,
                "tool_use" => BlockStart::ToolInvocation {
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                },
                other => BlockStart::Other(other.to_string()),
            };
            UpstreamEvent::BlockStart {
                index: index(),
                block: start,
            }
        }
        "content_block_delta" => {
            let delta = &event["delta"];
            let delta = match delta["type"].as_str().unwrap_or("") {
                "text_delta" => BlockDelta::Text(delta["text"].as_str().unwrap_or("").to_string()),
                "input_json_delta" => {
                    BlockDelta::PartialJson(delta["partial_json"].as_str().unwrap_or("").to_string())
                }
                _ => BlockDelta::Other,
            };
            UpstreamEvent::BlockDelta {
                index: index(),
                delta,
            }
        }
        "content_block_stop" => UpstreamEvent::BlockStop { index: index() },
        "message_delta" => UpstreamEvent::MessageDelta {
            stop_reason: event["delta"]["stop_reason"].as_str().map(StopReason::parse),
            usage: parse_usage(&event["usage"]),
        },
        "message_stop" => UpstreamEvent::MessageStop,
        "error" => {
            let error_type = event["error"]["type"].as_str().unwrap_or("error").to_string();
            let message = event["error"]["message"].as_str().unwrap_or("").to_string();
            return Some(Err(ProviderError::StreamError {
                error_type,
                message,
            }));
        }
        _ => return None,
    };

    Some(Ok(translated))
}

fn parse_usage(usage: &serde_json::Value) -> Option<Usage> {
    if !usage.is_object() {
        return None;
    }
    Some(Usage {
        input_tokens: usage["input_tokens"].as_u64().unwrap_or(0) as u32,
        output_tokens: usage["output_tokens"].as_u64().unwrap_or(0) as u32,
    })
}

/// Splits a byte stream into SSE lines.
///
/// Bytes are buffered until a newline arrives so multi-byte characters split
/// across network chunks are decoded intact.
#[derive(Default)]
struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            lines.push(line.trim_end_matches('\r').to_string());
        }
        lines
    }
}

// --- Anthropic API types ---

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: AnthropicContent,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum AnthropicContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}
