//! In-memory stand-in for the Graph query tool (spec §6: `query(text, query_type ∈
//! {entity, relation, path}, top_k) → {results:[{content, entities, relations, source}…]}`).

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::agentflow::tool_registry::ToolProtocol;
use crate::agentflow::types::{AgentContext, ToolResult};

pub struct GraphQueryTool;

impl GraphQueryTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GraphQueryTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolProtocol for GraphQueryTool {
    async fn execute(&self, _ctx: &AgentContext, arguments: HashMap<String, Value>) -> ToolResult {
        let text = arguments.get("text").and_then(|v| v.as_str()).unwrap_or("");
        let query_type = arguments.get("query_type").and_then(|v| v.as_str()).unwrap_or("entity");
        let result = serde_json::json!({
            "results": [{
                "content": format!("graph knowledge related to '{text}'"),
                "entities": [text],
                "relations": [query_type],
                "source": "graph#root",
            }]
        });
        ToolResult::success(result.to_string())
            .with_metadata(serde_json::json!({ "sources": [{ "source": "graph#root" }] }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn query_echoes_the_requested_query_type() {
        let tool = GraphQueryTool::new();
        let ctx = AgentContext::new("sess", 10, 300);
        let mut args = HashMap::new();
        args.insert("text".to_string(), Value::String("Python".to_string()));
        args.insert("query_type".to_string(), Value::String("relation".to_string()));
        let result = tool.execute(&ctx, args).await;
        assert!(result.success);
        assert!(result.output.contains("relation"));
    }
}
