//! Shared test utilities for the agent loop.

use std::sync::Mutex;

use async_trait::async_trait;
use loopwire_core::error::{ProviderError, ToolError};
use loopwire_core::provider::{
    BlockDelta, BlockStart, Provider, ProviderRequest, StopReason, UpstreamEvent, UpstreamStream,
};
use loopwire_core::tool::{Tool, ToolContext, ToolRegistry};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::stream_event::DownstreamEvent;

/// What the scripted provider does on one call.
pub enum Step {
    /// Stream these events, then close the channel.
    Respond(Vec<UpstreamEvent>),
    /// Fail before any stream exists.
    Fail(ProviderError),
    /// Open a stream whose first item is this error.
    StreamError(ProviderError),
    /// Open a stream that never produces anything.
    Hang,
}

/// A mock provider that plays back one step per call, in order.
pub struct ScriptedProvider {
    steps: Mutex<Vec<Step>>,
    requests: Mutex<Vec<ProviderRequest>>,
    held: Mutex<Vec<mpsc::Sender<Result<UpstreamEvent, ProviderError>>>>,
}

impl ScriptedProvider {
    pub fn new(mut steps: Vec<Step>) -> Self {
        steps.reverse();
        Self {
            steps: Mutex::new(steps),
            requests: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn request(&self, index: usize) -> Option<ProviderRequest> {
        self.requests.lock().unwrap().get(index).cloned()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, request: ProviderRequest) -> Result<UpstreamStream, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop()
            .expect("ScriptedProvider: no more steps");

        let (tx, rx) = mpsc::channel(64);
        match step {
            Step::Respond(events) => {
                for event in events {
                    tx.send(Ok(event)).await.unwrap();
                }
            }
            Step::Fail(e) => return Err(e),
            Step::StreamError(e) => tx.send(Err(e)).await.unwrap(),
            Step::Hang => self.held.lock().unwrap().push(tx),
        }
        Ok(rx)
    }
}

/// A complete text-only response made of `fragments`.
pub fn text_response(fragments: &[&str]) -> Vec<UpstreamEvent> {
    let mut events = vec![
        UpstreamEvent::MessageStart { usage: None },
        UpstreamEvent::BlockStart {
            index: 0,
            block: BlockStart::Text,
        },
    ];
    for fragment in fragments {
        events.push(UpstreamEvent::BlockDelta {
            index: 0,
            delta: BlockDelta::Text(fragment.to_string()),
        });
    }
    events.extend([
        UpstreamEvent::BlockStop { index: 0 },
        UpstreamEvent::MessageDelta {
            stop_reason: Some(StopReason::EndTurn),
            usage: None,
        },
        UpstreamEvent::MessageStop,
    ]);
    events
}

/// A response requesting each `(id, name, raw_json_input)` tool call.
pub fn tool_response(calls: &[(&str, &str, &str)]) -> Vec<UpstreamEvent> {
    let mut events = vec![UpstreamEvent::MessageStart { usage: None }];
    for (index, (id, name, input)) in calls.iter().enumerate() {
        events.push(UpstreamEvent::BlockStart {
            index,
            block: BlockStart::ToolInvocation {
                id: id.to_string(),
                name: name.to_string(),
            },
        });
        events.push(UpstreamEvent::BlockDelta {
            index,
            delta: BlockDelta::PartialJson(input.to_string()),
        });
        events.push(UpstreamEvent::BlockStop { index });
    }
    events.extend([
        UpstreamEvent::MessageDelta {
            stop_reason: Some(StopReason::ToolUse),
            usage: None,
        },
        UpstreamEvent::MessageStop,
    ]);
    events
}

/// Drain every event the loop sent.
pub async fn collect(mut rx: mpsc::Receiver<DownstreamEvent>) -> Vec<DownstreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

/// Returns its input unchanged.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Echoes back the input"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }
    async fn execute(&self, input: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        Ok(input)
    }
}

/// Always fails.
pub struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "fail"
    }
    fn description(&self) -> &str {
        "Always fails"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }
    async fn execute(&self, _input: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        Err(ToolError::ExecutionFailed {
            tool_name: "fail".into(),
            reason: "boom".into(),
        })
    }
}

pub fn registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(EchoTool));
    registry.register(Box::new(FailingTool));
    registry
}
