//! Tool dispatch executor.
//!
//! Turns one closed tool invocation into a `ToolInvocationResult`. Failures
//! never escape as `Err`: they become error-flagged results the model sees on
//! its next call.

use std::sync::Arc;
use std::time::Instant;

use loopwire_core::tool::{ToolContext, ToolInvocationResult, ToolOutcome, ToolRegistry};
use serde_json::Value;
use tracing::{debug, warn};

/// Appended to a success payload cut at the result budget.
pub const TRUNCATION_MARKER: &str = "\n...[truncated]";

pub const DEFAULT_RESULT_BUDGET: usize = 6000;

/// A finished invocation plus its one-line summary for observers.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub result: ToolInvocationResult,
    pub summary: String,
}

#[derive(Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    result_budget: usize,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            result_budget: DEFAULT_RESULT_BUDGET,
        }
    }

    /// Maximum characters of a success payload sent back upstream.
    pub fn with_result_budget(mut self, budget: usize) -> Self {
        self.result_budget = budget.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Run one invocation through the registry.
    pub async fn dispatch(
        &self,
        tool_id: &str,
        tool_name: &str,
        input: Value,
        ctx: &ToolContext,
    ) -> Dispatched {
        let started = Instant::now();
        debug!(tool = %tool_name, tool_id = %tool_id, "Executing tool");

        match self.registry.invoke(tool_name, input, ctx).await {
            Ok(output) => {
                let summary = self
                    .registry
                    .get(tool_name)
                    .map(|tool| tool.summarize(&output))
                    .unwrap_or_else(|| format!("{tool_name} completed"));
                let (payload, truncated) = truncate(render_payload(&output), self.result_budget);
                debug!(
                    tool = %tool_name,
                    tool_id = %tool_id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    truncated,
                    "Tool completed"
                );
                Dispatched {
                    result: ToolInvocationResult {
                        tool_id: tool_id.to_string(),
                        tool_name: tool_name.to_string(),
                        outcome: ToolOutcome::Success(payload),
                        truncated,
                    },
                    summary,
                }
            }
            Err(e) => {
                warn!(
                    tool = %tool_name,
                    tool_id = %tool_id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "Tool failed"
                );
                failure(tool_id, tool_name, e.to_string())
            }
        }
    }

    /// Result for an invocation whose input never parsed. The tool is not run.
    pub fn reject_malformed(&self, tool_id: &str, tool_name: &str, error: &str) -> Dispatched {
        warn!(tool = %tool_name, tool_id = %tool_id, "Rejecting tool call with malformed input");
        failure(
            tool_id,
            tool_name,
            format!(
                "Invalid tool input: the arguments were not valid JSON ({error}). \
                 Re-issue the call with a well-formed JSON object."
            ),
        )
    }
}

fn failure(tool_id: &str, tool_name: &str, message: String) -> Dispatched {
    Dispatched {
        summary: message.clone(),
        result: ToolInvocationResult {
            tool_id: tool_id.to_string(),
            tool_name: tool_name.to_string(),
            outcome: ToolOutcome::Failure(message),
            truncated: false,
        },
    }
}

/// Strings go upstream as-is; anything else as compact JSON.
fn render_payload(output: &Value) -> String {
    match output {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Cut `payload` to `budget` characters plus the marker.
pub fn truncate(payload: String, budget: usize) -> (String, bool) {
    match payload.char_indices().nth(budget) {
        None => (payload, false),
        Some((cut, _)) => {
            let mut truncated = payload;
            truncated.truncate(cut);
            truncated.push_str(TRUNCATION_MARKER);
            (truncated, true)
        }
    }
}
