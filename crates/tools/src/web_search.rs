//! Web search tool: deterministic offline results.
//!
//! A real deployment swaps this for a search API client. The stub returns
//! stable, query-shaped results so the loop can be exercised end to end
//! without network access.

use async_trait::async_trait;
use loopwire_core::error::ToolError;
use loopwire_core::tool::{Tool, ToolContext};
use serde::Serialize;
use serde_json::Value;

const MAX_RESULTS: u64 = 5;

pub struct WebSearchTool;

#[derive(Debug, Clone, Serialize)]
struct SearchHit {
    title: String,
    url: String,
    snippet: String,
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web. Returns a list of results with titles, URLs, and snippets."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                },
                "num_results": {
                    "type": "integer",
                    "description": "Number of results to return (default 3, max 5)",
                    "default": 3
                }
            },
            "required": ["query"]
        })
    }

    fn validate(&self, input: &Value) -> Result<(), ToolError> {
        match input["query"].as_str() {
            Some(q) if !q.trim().is_empty() => Ok(()),
            _ => Err(ToolError::InvalidArguments(
                "'query' must be a non-empty string".into(),
            )),
        }
    }

    async fn execute(&self, input: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let query = input["query"].as_str().unwrap_or_default().trim();
        let count = input["num_results"].as_u64().unwrap_or(3).clamp(1, MAX_RESULTS) as usize;

        let hits = search(query, count);
        Ok(serde_json::json!({
            "query": query,
            "results": hits,
        }))
    }

    fn summarize(&self, output: &Value) -> String {
        let count = output["results"].as_array().map_or(0, Vec::len);
        let query = output["query"].as_str().unwrap_or_default();
        format!("{count} results for '{query}'")
    }
}

fn search(query: &str, count: usize) -> Vec<SearchHit> {
    let slug: String = query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("-");

    (1..=count)
        .map(|rank| SearchHit {
            title: format!("{query} (result {rank})"),
            url: format!("https://example.com/{slug}/{rank}"),
            snippet: format!("Offline result {rank} for \"{query}\"."),
        })
        .collect()
}
