//! Upstream stream decoder.
//!
//! Rebuilds the content blocks of one model response from its lifecycle
//! events. Blocks live in an arena of slots keyed by the upstream block index;
//! deltas are routed by that index and the decoder remembers which block was
//! opened most recently.

use loopwire_core::message::ContentBlock;
use loopwire_core::provider::{BlockDelta, BlockStart, StopReason, UpstreamEvent, Usage};
use serde_json::Value;
use tracing::{debug, warn};

use crate::stream_event::DownstreamEvent;

/// How far past the last known slot a new block index may land.
const MAX_INDEX_GAP: usize = 16;

/// A tool invocation whose input buffer was not valid JSON when it closed.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedInput {
    pub tool_id: String,
    pub tool_name: String,
    pub error: String,
}

#[derive(Debug)]
enum BlockSlot {
    Text(String),
    ToolInvocation {
        id: String,
        name: String,
        buffer: String,
        input: Option<Value>,
    },
    /// A block kind we keep a slot for but never surface.
    Ignored(String),
}

/// Everything one upstream response produced, once the stream is over.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    /// Closed blocks in upstream index order. Empty text is dropped.
    pub blocks: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Usage,
    pub malformed: Vec<MalformedInput>,
}

impl DecodedMessage {
    /// Tool invocation blocks in the order the model emitted them.
    pub fn tool_invocations(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.blocks.iter().filter_map(|b| match b {
            ContentBlock::ToolInvocation { id, name, input } => {
                Some((id.as_str(), name.as_str(), input))
            }
            _ => None,
        })
    }

    /// Whether the loop has tools to run for this response.
    pub fn requests_tools(&self) -> bool {
        self.stop_reason == StopReason::ToolUse && self.tool_invocations().next().is_some()
    }

    /// Whether the input of `tool_id` failed to parse.
    pub fn malformed_input(&self, tool_id: &str) -> Option<&MalformedInput> {
        self.malformed.iter().find(|m| m.tool_id == tool_id)
    }
}

/// Incremental decoder for one upstream response.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    slots: Vec<Option<BlockSlot>>,
    current: Option<usize>,
    stop_reason: Option<StopReason>,
    usage: Usage,
    malformed: Vec<MalformedInput>,
    complete: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once `message_stop` has been seen.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Index of the most recently opened block.
    pub fn current_block(&self) -> Option<usize> {
        self.current
    }

    /// Feed one upstream event. Returns the client-facing event it produces,
    /// if any.
    pub fn apply(&mut self, event: UpstreamEvent) -> Option<DownstreamEvent> {
        match event {
            UpstreamEvent::MessageStart { usage } => {
                if let Some(usage) = usage {
                    self.usage = usage;
                }
                None
            }
            UpstreamEvent::BlockStart { index, block } => self.open(index, block),
            UpstreamEvent::BlockDelta { index, delta } => self.push_delta(index, delta),
            UpstreamEvent::BlockStop { index } => {
                self.close(index);
                None
            }
            UpstreamEvent::MessageDelta { stop_reason, usage } => {
                if let Some(reason) = stop_reason {
                    self.stop_reason = Some(reason);
                }
                // message_delta usage is cumulative for the response.
                if let Some(usage) = usage {
                    self.usage.update(usage);
                }
                None
            }
            UpstreamEvent::MessageStop => {
                self.complete = true;
                None
            }
        }
    }

    fn open(&mut self, index: usize, block: BlockStart) -> Option<DownstreamEvent> {
        if index > self.slots.len().saturating_add(MAX_INDEX_GAP) {
            warn!(
                index,
                known = self.slots.len(),
                "Block index out of range; ignoring block"
            );
            return None;
        }
        if self.slots.len() <= index {
            self.slots.resize_with(index + 1, || None);
        }
        if self.slots[index].is_some() {
            warn!(index, "Block index reopened; replacing previous block");
        }
        self.current = Some(index);

        let (slot, event) = match block {
            BlockStart::Text => (BlockSlot::Text(String::new()), None),
            BlockStart::ToolInvocation { id, name } => {
                debug!(index, tool = %name, tool_id = %id, "Tool invocation block opened");
                let event = DownstreamEvent::ToolStart {
                    tool_id: id.clone(),
                    tool_name: name.clone(),
                };
                (
                    BlockSlot::ToolInvocation {
                        id,
                        name,
                        buffer: String::new(),
                        input: None,
                    },
                    Some(event),
                )
            }
            BlockStart::Other(kind) => {
                debug!(index, kind = %kind, "Ignoring unsupported block kind");
                (BlockSlot::Ignored(kind), None)
            }
        };
        self.slots[index] = Some(slot);
        event
    }

    fn push_delta(&mut self, index: usize, delta: BlockDelta) -> Option<DownstreamEvent> {
        let Some(slot) = self.slots.get_mut(index).and_then(Option::as_mut) else {
            warn!(
                index,
                current = ?self.current,
                "Delta for a block that was never opened; ignoring"
            );
            return None;
        };

        match (slot, delta) {
            (BlockSlot::Text(text), BlockDelta::Text(fragment)) => {
                if fragment.is_empty() {
                    return None;
                }
                text.push_str(&fragment);
                Some(DownstreamEvent::TextDelta { content: fragment })
            }
            (BlockSlot::ToolInvocation { buffer, input, .. }, BlockDelta::PartialJson(fragment)) => {
                if input.is_some() {
                    warn!(index, "Input delta after block stop; ignoring");
                } else {
                    buffer.push_str(&fragment);
                }
                None
            }
            (BlockSlot::Ignored(_), _) | (_, BlockDelta::Other) => None,
            (_, delta) => {
                warn!(index, ?delta, "Delta kind does not match block kind; ignoring");
                None
            }
        }
    }

    fn close(&mut self, index: usize) {
        match self.slots.get_mut(index).and_then(Option::as_mut) {
            Some(BlockSlot::ToolInvocation {
                id,
                name,
                buffer,
                input,
            }) => {
                if input.is_none() {
                    let (parsed, error) = parse_input(buffer);
                    if let Some(error) = error {
                        warn!(
                            tool = %name,
                            tool_id = %id,
                            error = %error,
                            "Malformed tool input JSON; falling back to empty object"
                        );
                        self.malformed.push(MalformedInput {
                            tool_id: id.clone(),
                            tool_name: name.clone(),
                            error,
                        });
                    }
                    *input = Some(parsed);
                }
            }
            Some(_) => {}
            None => warn!(index, "Stop for a block that was never opened"),
        }
    }

    /// Freeze the decoded response. Tool blocks that never saw a stop are
    /// closed here so every invocation carries parsed input.
    pub fn finish(mut self) -> DecodedMessage {
        for index in 0..self.slots.len() {
            self.close_if_open(index);
        }

        let blocks = self
            .slots
            .into_iter()
            .flatten()
            .filter_map(|slot| match slot {
                BlockSlot::Text(text) if !text.is_empty() => Some(ContentBlock::Text { text }),
                BlockSlot::ToolInvocation { id, name, input, .. } => {
                    Some(ContentBlock::ToolInvocation {
                        id,
                        name,
                        input: input.unwrap_or_else(empty_object),
                    })
                }
                _ => None,
            })
            .collect();

        DecodedMessage {
            blocks,
            stop_reason: self.stop_reason.unwrap_or(StopReason::EndTurn),
            usage: self.usage,
            malformed: self.malformed,
        }
    }

    fn close_if_open(&mut self, index: usize) {
        if matches!(
            self.slots.get(index),
            Some(Some(BlockSlot::ToolInvocation { input: None, .. }))
        ) {
            self.close(index);
        }
    }
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Parse a closed input buffer. An empty buffer is an empty object.
fn parse_input(buffer: &str) -> (Value, Option<String>) {
    if buffer.trim().is_empty() {
        return (empty_object(), None);
    }
    match serde_json::from_str::<Value>(buffer) {
        Ok(value) => (value, None),
        Err(e) => (empty_object(), Some(e.to_string())),
    }
}
