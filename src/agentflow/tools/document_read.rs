//! In-memory stand-in for the Document reader tool (spec §6: `read(document_id,
//! chunk_index?, max_length) → {title, content, total_chunks, metadata}`).

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::agentflow::tool_registry::ToolProtocol;
use crate::agentflow::types::{AgentContext, ToolResult};

const DEFAULT_MAX_LENGTH: usize = 2000;

pub struct DocumentReadTool {
    chunks: HashMap<&'static str, Vec<&'static str>>,
}

impl DocumentReadTool {
    pub fn new() -> Self {
        let mut chunks = HashMap::new();
        chunks.insert(
            "doc1",
            vec![
                "Python was created by Guido van Rossum and first released in 1991.",
                "It emphasizes code readability with significant indentation.",
                "Python is widely used for web development, data science, and scripting.",
            ],
        );
        Self { chunks }
    }

    fn title_for(document_id: &str) -> String {
        format!("Document {document_id}")
    }
}

impl Default for DocumentReadTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolProtocol for DocumentReadTool {
    async fn execute(&self, _ctx: &AgentContext, arguments: HashMap<String, Value>) -> ToolResult {
        let document_id = match arguments.get("document_id").and_then(|v| v.as_str()) {
            Some(id) => id,
            None => return ToolResult::failure("missing required field 'document_id'"),
        };
        let max_length = arguments
            .get("max_length")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_MAX_LENGTH as u64) as usize;

        let doc_chunks = match self.chunks.get(document_id) {
            Some(c) => c,
            None => return ToolResult::failure(format!("document not found: {document_id}")),
        };

        let content = if let Some(index) = arguments.get("chunk_index").and_then(|v| v.as_u64()) {
            match doc_chunks.get(index as usize) {
                Some(chunk) => chunk.to_string(),
                None => return ToolResult::failure(format!("chunk index {index} out of range")),
            }
        } else {
            doc_chunks.join(" ")
        };
        let truncated: String = content.chars().take(max_length).collect();

        let body = serde_json::json!({
            "title": Self::title_for(document_id),
            "content": truncated,
            "total_chunks": doc_chunks.len(),
            "metadata": { "document_id": document_id },
        });
        ToolResult::success(body.to_string())
            .with_metadata(serde_json::json!({ "sources": [{ "source": document_id }] }))
    }
}
