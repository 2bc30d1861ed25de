//! # Loopwire Core
//!
//! Domain types, traits, and error definitions for the Loopwire tool-calling
//! runtime. This crate has **zero framework dependencies**: it defines the
//! domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every collaborator of the agent loop is a trait here. Implementations live
//! in their respective crates:
//! - `Provider`: an upstream language model that streams typed events
//! - `Tool`: a named capability the model can invoke mid-conversation

pub mod error;
pub mod message;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{ProviderError, ToolError};
pub use message::{ContentBlock, ConversationId, ConversationTurn, Role};
pub use provider::{
    BlockDelta, BlockStart, Provider, ProviderRequest, StopReason, ToolDefinition, UpstreamEvent,
    UpstreamStream, Usage,
};
pub use tool::{Tool, ToolContext, ToolInvocationResult, ToolOutcome, ToolRegistry};
