//! Provider trait: the abstraction over upstream language models.
//!
//! A Provider knows how to send a conversation to a model and hand back the
//! model's answer as an ordered stream of typed lifecycle events. Decoding
//! those events into content blocks is the agent crate's job.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::message::ConversationTurn;

/// Configuration for a single upstream call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// The model to use (e.g., "claude-sonnet-4-20250514")
    pub model: String,

    /// Top-level system prompt, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    /// The conversation so far
    pub turns: Vec<ConversationTurn>,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    pub max_tokens: u32,

    /// Available tools the model can call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
}

fn default_temperature() -> f32 {
    0.7
}

/// A tool definition sent to the model so it knows what tools it can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    /// Add another usage sample onto this one.
    pub fn accumulate(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    /// Fold in a later cumulative sample for the same response. Counts the
    /// sample reports replace earlier ones; zero means "not reported".
    pub fn update(&mut self, later: Usage) {
        if later.input_tokens > 0 {
            self.input_tokens = later.input_tokens;
        }
        if later.output_tokens > 0 {
            self.output_tokens = later.output_tokens;
        }
    }
}

/// Why the model stopped generating for a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    #[serde(untagged)]
    Other(String),
}

impl StopReason {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "end_turn" => Self::EndTurn,
            "tool_use" => Self::ToolUse,
            "max_tokens" => Self::MaxTokens,
            "stop_sequence" => Self::StopSequence,
            other => Self::Other(other.to_string()),
        }
    }

    /// The wire name, as `parse` accepts it.
    pub fn as_str(&self) -> &str {
        match self {
            Self::EndTurn => "end_turn",
            Self::ToolUse => "tool_use",
            Self::MaxTokens => "max_tokens",
            Self::StopSequence => "stop_sequence",
            Self::Other(raw) => raw,
        }
    }
}

/// What kind of block a `BlockStart` opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockStart {
    Text,
    /// A tool invocation; id and name are known before any input arrives.
    ToolInvocation { id: String, name: String },
    /// A block kind the runtime does not act on (e.g. "thinking").
    Other(String),
}

/// Incremental payload for an open block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockDelta {
    Text(String),
    PartialJson(String),
    Other,
}

/// One upstream lifecycle event, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    MessageStart { usage: Option<Usage> },
    BlockStart { index: usize, block: BlockStart },
    BlockDelta { index: usize, delta: BlockDelta },
    BlockStop { index: usize },
    MessageDelta {
        stop_reason: Option<StopReason>,
        usage: Option<Usage>,
    },
    MessageStop,
}

/// Receiving half of an upstream event stream.
pub type UpstreamStream =
    tokio::sync::mpsc::Receiver<std::result::Result<UpstreamEvent, ProviderError>>;

/// The core Provider trait.
///
/// The agent loop calls `stream()` without knowing which backend is in use.
/// An `Err` from `stream()` means the call never started (HTTP error status,
/// network failure); errors inside the returned channel mean the response
/// broke off part way.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "anthropic").
    fn name(&self) -> &str;

    /// Send a request and get a stream of upstream events.
    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<UpstreamStream, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_reason_parsing() {
        assert_eq!(StopReason::parse("tool_use"), StopReason::ToolUse);
        assert_eq!(StopReason::parse("end_turn"), StopReason::EndTurn);
        assert_eq!(
            StopReason::parse("refusal"),
            StopReason::Other("refusal".into())
        );
        assert_eq!(StopReason::parse("max_tokens").as_str(), "max_tokens");
        assert_eq!(StopReason::parse("refusal").as_str(), "refusal");
    }

    #[test]
    fn stop_reason_serde_matches_wire_names() {
        let parsed: StopReason = serde_json::from_str(r#""max_tokens""#).unwrap();
        assert_eq!(parsed, StopReason::MaxTokens);
        let other: StopReason = serde_json::from_str(r#""pause_turn""#).unwrap();
        assert_eq!(other, StopReason::Other("pause_turn".into()));
    }

    #[test]
    fn usage_accumulates() {
        let mut usage = Usage::default();
        usage.accumulate(Usage {
            input_tokens: 10,
            output_tokens: 5,
        });
        usage.accumulate(Usage {
            input_tokens: 20,
            output_tokens: 7,
        });
        assert_eq!(usage.input_tokens, 30);
        assert_eq!(usage.total(), 42);
    }

    #[test]
    fn usage_update_replaces_reported_counts() {
        let mut usage = Usage {
            input_tokens: 25,
            output_tokens: 1,
        };
        usage.update(Usage {
            input_tokens: 0,
            output_tokens: 15,
        });
        assert_eq!(usage.input_tokens, 25);
        assert_eq!(usage.output_tokens, 15);
    }

    #[test]
    fn tool_definition_serialization() {
        let tool = ToolDefinition {
            name: "web_search".into(),
            description: "Search the web".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" }
                },
                "required": ["query"]
            }),
        };
        let json = serde_json::to_string(&tool).unwrap();
        assert!(json.contains("web_search"));
        assert!(json.contains("query"));
    }
}
