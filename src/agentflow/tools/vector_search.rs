//! In-memory stand-in for the Vector search tool (spec §6: `query(text, top_k, language)
//! → {results:[{content, source, score}…]}`).

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::agentflow::tool_registry::ToolProtocol;
use crate::agentflow::types::{AgentContext, ToolResult};

#[derive(Debug, Clone)]
struct Document {
    content: String,
    source: String,
    score: f64,
}

/// A fixed in-memory corpus, scored by a trivial keyword-overlap heuristic rather than
/// a real embedding model — enough to exercise the Agent Executor end-to-end in tests.
pub struct VectorSearchTool {
    corpus: Vec<Document>,
}

impl VectorSearchTool {
    pub fn new() -> Self {
        Self {
            corpus: vec![
                Document {
                    content: "Python is a high-level, dynamically typed programming language.".to_string(),
                    source: "doc1#c3".to_string(),
                    score: 0.92,
                },
                Document {
                    content: "Go is a statically typed, compiled language designed at Google.".to_string(),
                    source: "doc2#c1".to_string(),
                    score: 0.88,
                },
                Document {
                    content: "Rust emphasizes memory safety without a garbage collector.".to_string(),
                    source: "doc3#c5".to_string(),
                    score: 0.81,
                },
            ],
        }
    }

    fn search(&self, text: &str, top_k: usize) -> Vec<&Document> {
        let needle = text.to_lowercase();
        let mut scored: Vec<(&Document, usize)> = self
            .corpus
            .iter()
            .map(|doc| {
                let overlap = needle
                    .split_whitespace()
                    .filter(|w| w.len() > 2 && doc.content.to_lowercase().contains(*w))
                    .count();
                (doc, overlap)
            })
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1));
        if scored.iter().all(|(_, overlap)| *overlap == 0) {
            // nothing matched; fall back to the corpus' own ranking
        }
        scored.into_iter().take(top_k.max(1)).map(|(doc, _)| doc).collect()
    }
}

impl Default for VectorSearchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolProtocol for VectorSearchTool {
    async fn execute(&self, _ctx: &AgentContext, arguments: HashMap<String, Value>) -> ToolResult {
        let text = arguments.get("text").and_then(|v| v.as_str()).unwrap_or("");
        let top_k = arguments.get("top_k").and_then(|v| v.as_u64()).unwrap_or(3) as usize;
        let hits = self.search(text, top_k);
        let results: Vec<Value> = hits
            .iter()
            .map(|doc| {
                serde_json::json!({
                    "content": doc.content,
                    "source": doc.source,
                    "score": doc.score,
                })
            })
            .collect();
        let sources: Vec<Value> = hits
            .iter()
            .map(|doc| serde_json::json!({ "source": doc.source, "score": doc.score }))
            .collect();
        ToolResult::success(serde_json::json!({ "results": results }).to_string())
            .with_metadata(serde_json::json!({ "sources": sources }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn search_returns_a_ranked_hit_with_a_source() {
        let tool = VectorSearchTool::new();
        let ctx = AgentContext::new("sess", 10, 300);
        let mut args = HashMap::new();
        args.insert("text".to_string(), Value::String("What is Python?".to_string()));
        let result = tool.execute(&ctx, args).await;
        assert!(result.success);
        assert!(result.output.contains("doc1#c3"));
        let sources = result.metadata.unwrap()["sources"].as_array().unwrap().len();
        assert!(sources >= 1);
    }
}
