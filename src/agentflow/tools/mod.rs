//! In-process stand-ins for the knowledge-retrieval external collaborators named in
//! spec §6: vector search, graph query, issue tracker (the IMS search tool), document
//! reader, web fetcher, and shell. Each is a [`crate::agentflow::tool_registry::ToolProtocol`]
//! implementation whose internals are intentionally minimal — in-memory fixtures, and
//! for the shell tool, a real sandboxed subprocess runner grounded on `tools/bash.rs` —
//! enough to exercise registry, permission, and executor logic end-to-end without a
//! live vector/graph store or network access. Swapping in production-grade backends
//! means providing a different `ToolProtocol` impl; the orchestration core is unaffected.

pub mod document_read;
pub mod graph_query;
pub mod issue_tracker;
pub mod shell;
pub mod vector_search;
pub mod web_fetch;

pub use document_read::DocumentReadTool;
pub use graph_query::GraphQueryTool;
pub use issue_tracker::IssueTrackerTool;
pub use shell::ShellTool;
pub use vector_search::VectorSearchTool;
pub use web_fetch::WebFetchTool;

use std::sync::Arc;

use crate::agentflow::tool_registry::{ParamType, Tool, ToolMetadata, ToolParameter, ToolRegistry};

/// Build a [`ToolRegistry`] populated with the six stand-in tools, under the names the
/// default per-[`crate::agentflow::types::AgentKind`] allowlists in
/// [`crate::agentflow::tool_registry::default_tools_for`] expect.
pub fn populate_default_registry(registry: &mut ToolRegistry) {
    registry.register(Tool::new(
        ToolMetadata::new("vector_search", "Semantic search over the knowledge base's vector store.")
            .with_parameter(ToolParameter::new("text", ParamType::String).required().with_description("query text"))
            .with_parameter(ToolParameter::new("top_k", ParamType::Integer).with_description("number of hits to return"))
            .with_parameter(ToolParameter::new("language", ParamType::String).with_description("response language hint")),
        Arc::new(VectorSearchTool::new()),
    ));
    registry.register(Tool::new(
        ToolMetadata::new("graph_query", "Query the knowledge graph for entities, relations, or paths.")
            .with_parameter(ToolParameter::new("text", ParamType::String).required())
            .with_parameter(ToolParameter::new("query_type", ParamType::String).with_description("entity | relation | path"))
            .with_parameter(ToolParameter::new("top_k", ParamType::Integer)),
        Arc::new(GraphQueryTool::new()),
    ));
    registry.register(Tool::new(
        ToolMetadata::new("ims_search", "Search the issue-tracker backend by free text and filters.")
            .with_parameter(ToolParameter::new("text", ParamType::String).required())
            .with_parameter(ToolParameter::new("filters", ParamType::Object)),
        Arc::new(IssueTrackerTool::new()),
    ));
    registry.register(Tool::new(
        ToolMetadata::new("document_read", "Read a stored document by id, optionally a specific chunk.")
            .with_parameter(ToolParameter::new("document_id", ParamType::String).required())
            .with_parameter(ToolParameter::new("chunk_index", ParamType::Integer))
            .with_parameter(ToolParameter::new("max_length", ParamType::Integer)),
        Arc::new(DocumentReadTool::new()),
    ));
    registry.register(Tool::new(
        ToolMetadata::new("web_fetch", "Fetch a URL and optionally extract its readable text.")
            .with_parameter(ToolParameter::new("url", ParamType::String).required())
            .with_parameter(ToolParameter::new("extract_text", ParamType::Boolean))
            .with_parameter(ToolParameter::new("max_length", ParamType::Integer)),
        Arc::new(WebFetchTool::new()),
    ));
    registry.register(Tool::new(
        ToolMetadata::new("shell", "Run a shell command in a sandboxed working directory.")
            .with_parameter(ToolParameter::new("command", ParamType::String).required())
            .with_parameter(ToolParameter::new("timeout", ParamType::Integer))
            .with_parameter(ToolParameter::new("working_dir", ParamType::String)),
        Arc::new(ShellTool::new()),
    ));
}
