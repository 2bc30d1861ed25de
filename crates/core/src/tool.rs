//! Tool trait: the abstraction over agent capabilities.
//!
//! Tools are what give the agent the ability to act in the world: search the
//! web, scrape a page, look up keyword data, write a CRM record. The runtime
//! only sees the uniform `invoke(name, input, context)` contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::ToolError;
use crate::message::{ContentBlock, ConversationId};
use crate::provider::ToolDefinition;

/// Per-request context handed to every tool invocation.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub conversation_id: ConversationId,
}

/// How a single invocation ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum ToolOutcome {
    /// Serialized (and possibly truncated) payload.
    Success(String),
    /// Error message fed back to the model.
    Failure(String),
}

/// The result of executing one tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocationResult {
    /// The invocation id this result answers
    pub tool_id: String,

    /// Name of the tool that ran
    pub tool_name: String,

    pub outcome: ToolOutcome,

    /// Whether the success payload was cut to the result budget
    #[serde(default)]
    pub truncated: bool,
}

impl ToolInvocationResult {
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Failure(_))
    }

    /// Convert into the block echoed back to the model.
    pub fn to_block(&self) -> ContentBlock {
        let (content, is_error) = match &self.outcome {
            ToolOutcome::Success(payload) => (payload.clone(), false),
            ToolOutcome::Failure(message) => (format!("Error: {message}"), true),
        };
        ContentBlock::ToolResult {
            tool_id: self.tool_id.clone(),
            content,
            is_error,
        }
    }
}

/// The core Tool trait.
///
/// Each capability implements this trait and is registered in the
/// `ToolRegistry` at startup.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "web_search").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Cheap pre-flight check of the input before `execute` runs.
    fn validate(&self, _input: &serde_json::Value) -> std::result::Result<(), ToolError> {
        Ok(())
    }

    /// Execute the tool with the given input.
    async fn execute(
        &self,
        input: serde_json::Value,
        ctx: &ToolContext,
    ) -> std::result::Result<serde_json::Value, ToolError>;

    /// One-line, human-readable description of a successful output.
    fn summarize(&self, _output: &serde_json::Value) -> String {
        format!("{} completed", self.name())
    }

    /// Convert this tool into a ToolDefinition for sending to the model.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A registry of available tools.
///
/// The agent loop uses this to:
/// 1. Get tool definitions to send to the model
/// 2. Look up and execute tools when the model requests them
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// Get all tool definitions, sorted by name so requests are stable.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Validate and execute a tool by name.
    pub async fn invoke(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: &ToolContext,
    ) -> std::result::Result<serde_json::Value, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        tool.validate(&input)?;
        tool.execute(input, ctx).await
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
