//! Page fetch tool: downloads a URL and reduces the HTML to readable text.

use std::time::Duration;

use async_trait::async_trait;
use loopwire_core::error::ToolError;
use loopwire_core::tool::{Tool, ToolContext};
use serde_json::Value;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

pub struct FetchPageTool {
    client: reqwest::Client,
}

impl FetchPageTool {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("loopwire/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for FetchPageTool {
    fn default() -> Self {
        Self::new()
    }
}

fn failed(reason: impl Into<String>) -> ToolError {
    ToolError::ExecutionFailed {
        tool_name: "fetch_page".into(),
        reason: reason.into(),
    }
}

#[async_trait]
impl Tool for FetchPageTool {
    fn name(&self) -> &str {
        "fetch_page"
    }

    fn description(&self) -> &str {
        "Fetch a web page over HTTP(S) and return its title and visible text."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "Absolute http:// or https:// URL to fetch"
                }
            },
            "required": ["url"]
        })
    }

    fn validate(&self, input: &Value) -> Result<(), ToolError> {
        let url = input["url"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'url' argument".into()))?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ToolError::InvalidArguments(
                "URL must start with http:// or https://".into(),
            ));
        }
        Ok(())
    }

    async fn execute(&self, input: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let url = input["url"].as_str().unwrap_or_default();
        debug!(url, "Fetching page");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("HTTP {} from {url}", status.as_u16())));
        }

        let html = response.text().await.map_err(|e| failed(e.to_string()))?;
        Ok(serde_json::json!({
            "url": url,
            "status": status.as_u16(),
            "title": extract_title(&html),
            "text": visible_text(&html),
        }))
    }

    fn summarize(&self, output: &Value) -> String {
        let url = output["url"].as_str().unwrap_or_default();
        let chars = output["text"].as_str().map_or(0, |t| t.chars().count());
        format!("Fetched {url} ({chars} chars)")
    }
}

fn extract_title(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let start = lower.find("<title")?;
    let open_end = lower[start..].find('>')? + start + 1;
    let close = lower[open_end..].find("</title>")? + open_end;
    let title = html[open_end..close].trim();
    (!title.is_empty()).then(|| title.to_string())
}

/// Strip tags, drop script/style bodies, and collapse whitespace.
fn visible_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let mut rest = html;

    while let Some(lt) = rest.find('<') {
        out.push_str(&rest[..lt]);
        out.push(' ');
        rest = &rest[lt..];

        let tag_end = match rest.find('>') {
            Some(i) => i,
            None => {
                rest = "";
                break;
            }
        };
        let tag = rest[1..tag_end].trim_start().to_ascii_lowercase();
        rest = &rest[tag_end + 1..];

        for skipped in ["script", "style"] {
            if tag.starts_with(skipped) {
                let closing = format!("</{skipped}");
                rest = match rest.to_ascii_lowercase().find(&closing) {
                    Some(i) => &rest[i..],
                    None => "",
                };
            }
        }
    }
    out.push_str(rest);

    out.split_whitespace().collect::<Vec<_>>().join(" ")
}
