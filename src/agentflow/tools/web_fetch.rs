//! Web fetcher tool (spec §6: `fetch(url, extract_text, max_length) → {url, title,
//! content, content_type}`), grounded on `tools/http_client.rs`'s use of `reqwest` for
//! outbound HTTP, but narrowed to the single GET-and-extract operation the spec needs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use serde_json::Value;

use crate::agentflow::tool_registry::ToolProtocol;
use crate::agentflow::types::{AgentContext, ToolResult};

/// Output-size cap this tool enforces on fetched content (spec §4.1 "tools are expected
/// to enforce their own output-size caps"), also used by the orchestrator's own
/// `url_context` truncation in spec §4.8 step 2.
pub const MAX_FETCH_LENGTH: usize = 10 * 1024;

pub struct WebFetchTool {
    client: reqwest::Client,
}

impl WebFetchTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    /// Strip HTML tags with a naive scan; good enough for a fixture tool, not a real
    /// readability pass.
    fn strip_html(body: &str) -> String {
        let mut out = String::with_capacity(body.len());
        let mut in_tag = false;
        for c in body.chars() {
            match c {
                '<' => in_tag = true,
                '>' => in_tag = false,
                _ if !in_tag => out.push(c),
                _ => {}
            }
        }
        out.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    pub fn truncate(text: &str, max_length: usize) -> String {
        if text.chars().count() <= max_length {
            text.to_string()
        } else {
            let mut truncated: String = text.chars().take(max_length).collect();
            truncated.push_str("...");
            truncated
        }
    }
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolProtocol for WebFetchTool {
    async fn execute(&self, _ctx: &AgentContext, arguments: HashMap<String, Value>) -> ToolResult {
        let url = match arguments.get("url").and_then(|v| v.as_str()) {
            Some(u) => u,
            None => return ToolResult::failure("missing required field 'url'"),
        };
        let extract_text = arguments.get("extract_text").and_then(|v| v.as_bool()).unwrap_or(true);
        let max_length = arguments
            .get("max_length")
            .and_then(|v| v.as_u64())
            .unwrap_or(MAX_FETCH_LENGTH as u64) as usize;

        let response = match self.client.get(url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("web_fetch failed for {url}: {e}");
                return ToolResult::failure(format!("fetch failed: {e}"));
            }
        };
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/plain")
            .to_string();
        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => return ToolResult::failure(format!("failed to read response body: {e}")),
        };
        let content = if extract_text { Self::strip_html(&body) } else { body };
        let content = Self::truncate(&content, max_length);
        let title = content.lines().next().unwrap_or("").chars().take(120).collect::<String>();

        let result = serde_json::json!({
            "url": url,
            "title": title,
            "content": content,
            "content_type": content_type,
        });
        ToolResult::success(result.to_string()).with_metadata(serde_json::json!({ "sources": [{ "source": url }] }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_html_removes_tags() {
        let stripped = WebFetchTool::strip_html("<p>Hello <b>world</b></p>");
        assert_eq!(stripped, "Hello world");
    }

    #[test]
    fn truncate_appends_ellipsis_when_over_limit() {
        let text = "a".repeat(20);
        let truncated = WebFetchTool::truncate(&text, 5);
        assert_eq!(truncated, "aaaaa...");
    }

    #[test]
    fn truncate_is_a_no_op_within_the_limit() {
        assert_eq!(WebFetchTool::truncate("short", 100), "short");
    }

    #[tokio::test]
    async fn missing_url_fails_without_a_network_call() {
        let tool = WebFetchTool::new();
        let ctx = AgentContext::new("sess", 10, 300);
        let result = tool.execute(&ctx, HashMap::new()).await;
        assert!(!result.success);
    }
}
