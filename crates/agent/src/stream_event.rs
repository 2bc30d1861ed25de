//! Client-facing streaming events.
//!
//! `DownstreamEvent` is what the agent loop reports while it runs. The gateway
//! serializes each one as a single JSON payload; field names are camelCase on
//! the wire:
//! - `text`: a fragment of assistant text
//! - `tool_start`: the model opened a tool invocation
//! - `tool_result`: a tool finished successfully
//! - `tool_error`: a tool failed (the loop keeps going)
//! - `done`: the request completed
//! - `error`: the request aborted

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum DownstreamEvent {
    /// Partial text from the model, or the closing tool-failure warning.
    #[serde(rename = "text")]
    TextDelta { content: String },

    /// A tool invocation block opened; its input is not known yet.
    ToolStart { tool_id: String, tool_name: String },

    /// Tool execution completed.
    ToolResult {
        tool_id: String,
        tool_name: String,
        summary: String,
        truncated: bool,
    },

    /// Tool execution failed; the error was fed back to the model.
    ToolError {
        tool_id: String,
        tool_name: String,
        error: String,
    },

    /// The stream is complete.
    Done {
        conversation_id: String,
        iterations: usize,
        tool_calls: usize,
    },

    /// The request aborted.
    Error { message: String },
}

impl DownstreamEvent {
    /// Wire name of this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TextDelta { .. } => "text",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolResult { .. } => "tool_result",
            Self::ToolError { .. } => "tool_error",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_delta_wire_format() {
        let event = DownstreamEvent::TextDelta {
            content: "Hello".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"text","content":"Hello"}"#);
    }

    #[test]
    fn tool_events_use_camel_case_ids() {
        let event = DownstreamEvent::ToolStart {
            tool_id: "toolu_1".into(),
            tool_name: "web_search".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"tool_start""#));
        assert!(json.contains(r#""toolId":"toolu_1""#));
        assert!(json.contains(r#""toolName":"web_search""#));

        let event = DownstreamEvent::ToolError {
            tool_id: "toolu_1".into(),
            tool_name: "web_search".into(),
            error: "timeout".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"tool_error""#));
        assert!(json.contains(r#""error":"timeout""#));
    }

    #[test]
    fn done_wire_format() {
        let event = DownstreamEvent::Done {
            conversation_id: "abc".into(),
            iterations: 2,
            tool_calls: 1,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"done""#));
        assert!(json.contains(r#""conversationId":"abc""#));
        assert!(json.contains(r#""toolCalls":1"#));
        assert!(event.is_terminal());
    }

    #[test]
    fn event_type_names_match_tags() {
        let events = vec![
            DownstreamEvent::TextDelta { content: "x".into() },
            DownstreamEvent::ToolStart {
                tool_id: "a".into(),
                tool_name: "b".into(),
            },
            DownstreamEvent::ToolResult {
                tool_id: "a".into(),
                tool_name: "b".into(),
                summary: "c".into(),
                truncated: false,
            },
            DownstreamEvent::ToolError {
                tool_id: "a".into(),
                tool_name: "b".into(),
                error: "c".into(),
            },
            DownstreamEvent::Error { message: "x".into() },
        ];
        for event in events {
            let json: serde_json::Value = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.event_type());
            assert!(!event.is_terminal() || event.event_type() == "error");
        }
    }

    #[test]
    fn event_deserialization() {
        let json = r#"{"type":"tool_result","toolId":"t1","toolName":"x","summary":"ok","truncated":true}"#;
        let event: DownstreamEvent = serde_json::from_str(json).unwrap();
        match event {
            DownstreamEvent::ToolResult {
                tool_id, truncated, ..
            } => {
                assert_eq!(tool_id, "t1");
                assert!(truncated);
            }
            other => panic!("Wrong variant: {other:?}"),
        }
    }
}
