//! In-memory stand-in for the Issue tracker tool (spec §6: `search(text, filters) →
//! {results:[{id, title, status, description, …}…]}`), registered under the name
//! `ims_search` in the default tool tables.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::agentflow::tool_registry::ToolProtocol;
use crate::agentflow::types::{AgentContext, ToolResult};

#[derive(Debug, Clone)]
struct Issue {
    id: String,
    title: String,
    status: &'static str,
    description: String,
}

pub struct IssueTrackerTool {
    issues: Vec<Issue>,
}

impl IssueTrackerTool {
    pub fn new() -> Self {
        Self {
            issues: vec![
                Issue {
                    id: "1024567".to_string(),
                    title: "Login fails intermittently on mobile".to_string(),
                    status: "open",
                    description: "Users report session expiry mid-flow on Android.".to_string(),
                },
                Issue {
                    id: "9981234".to_string(),
                    title: "Export button missing on report page".to_string(),
                    status: "resolved",
                    description: "CSS regression hid the export action.".to_string(),
                },
            ],
        }
    }
}

impl Default for IssueTrackerTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolProtocol for IssueTrackerTool {
    async fn execute(&self, _ctx: &AgentContext, arguments: HashMap<String, Value>) -> ToolResult {
        let text = arguments.get("text").and_then(|v| v.as_str()).unwrap_or("").to_lowercase();
        let status_filter = arguments
            .get("filters")
            .and_then(|v| v.get("status"))
            .and_then(|v| v.as_str());

        let hits: Vec<&Issue> = self
            .issues
            .iter()
            .filter(|issue| {
                let matches_text = text.is_empty()
                    || issue.title.to_lowercase().contains(&text)
                    || issue.id == text;
                let matches_status = status_filter.map(|s| s == issue.status).unwrap_or(true);
                matches_text && matches_status
            })
            .collect();

        let results: Vec<Value> = hits
            .iter()
            .map(|issue| {
                serde_json::json!({
                    "id": issue.id,
                    "title": issue.title,
                    "status": issue.status,
                    "description": issue.description,
                })
            })
            .collect();
        let sources: Vec<Value> = hits.iter().map(|issue| serde_json::json!({ "source": issue.id })).collect();
        ToolResult::success(serde_json::json!({ "results": results }).to_string())
            .with_metadata(serde_json::json!({ "sources": sources }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn searches_by_title_text() {
        let tool = IssueTrackerTool::new();
        let ctx = AgentContext::new("sess", 10, 300);
        let mut args = HashMap::new();
        args.insert("text".to_string(), Value::String("login".to_string()));
        let result = tool.execute(&ctx, args).await;
        assert!(result.success);
        assert!(result.output.contains("1024567"));
    }

    #[tokio::test]
    async fn status_filter_narrows_results() {
        let tool = IssueTrackerTool::new();
        let ctx = AgentContext::new("sess", 10, 300);
        let mut args = HashMap::new();
        args.insert("text".to_string(), Value::String("".to_string()));
        args.insert("filters".to_string(), serde_json::json!({ "status": "resolved" }));
        let result = tool.execute(&ctx, args).await;
        assert!(result.output.contains("9981234"));
        assert!(!result.output.contains("1024567"));
    }
}
