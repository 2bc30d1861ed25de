//! The agentic tool-calling loop.
//!
//! One user message goes in; the loop then:
//!
//! 1. **Calls** the upstream model (with overload retry)
//! 2. **Decodes** its streaming response into text and tool invocation blocks
//! 3. **If the model asked for tools**: runs them in order, appends the
//!    results, and goes back to step 1
//! 4. **Otherwise**: reports any tool failures and finishes
//!
//! Progress is reported as [`DownstreamEvent`]s over a channel so a transport
//! (SSE in the gateway, stdout in the CLI) can relay it as it happens.

pub mod decoder;
pub mod dispatch;
pub mod loop_runner;
pub mod stream_event;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use decoder::{DecodedMessage, MalformedInput, StreamDecoder};
pub use dispatch::{Dispatched, ToolDispatcher, TRUNCATION_MARKER};
pub use loop_runner::{
    AgentLoop, LoopOutcome, LoopRequest, LoopStatus, OVERLOADED_MESSAGE, Phase, ToolFailure,
};
pub use stream_event::DownstreamEvent;
