//! Tool Registry (spec §4.1).
//!
//! A process-wide, name-keyed catalog of [`Tool`] instances plus the per-[`AgentKind`]
//! default allowlists that drive both the [`crate::agentflow::agent_registry`] and the
//! [`crate::agentflow::permissions`] default rule tables. Grounded on
//! `tool_protocol.rs`'s `ToolRegistry`/`ToolMetadata`/`ToolParameter`, narrowed from that
//! file's single/multi-protocol routing down to a flat map since this crate has exactly
//! one protocol implementation per tool.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use serde_json::Value;

use super::types::AgentKind;

/// A JSON-schema parameter type, matching the subset the Chat LLM tool-calling contract
/// understands.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    fn as_json_schema_name(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Integer => "integer",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }

    /// Whether `value` is consistent with this declared type.
    fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
        }
    }
}

/// One named, typed argument a tool accepts.
#[derive(Debug, Clone)]
pub struct ToolParameter {
    pub name: String,
    pub param_type: ParamType,
    pub description: String,
    pub required: bool,
}

impl ToolParameter {
    pub fn new(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: String::new(),
            required: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Static description of a tool: name, prose description, and its JSON-schema argument
/// spec, exported verbatim to the Chat LLM as a [`crate::agentflow::client::ToolDefinition`].
#[derive(Debug, Clone)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
}

impl ToolMetadata {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, param: ToolParameter) -> Self {
        self.parameters.push(param);
        self
    }

    /// Render this tool's parameters as a JSON-schema `object` spec, the shape the
    /// Chat LLM's function-calling contract expects (spec §6).
    pub fn json_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            properties.insert(
                param.name.clone(),
                serde_json::json!({
                    "type": param.param_type.as_json_schema_name(),
                    "description": param.description,
                }),
            );
            if param.required {
                required.push(Value::String(param.name.clone()));
            }
        }
        serde_json::json!({
            "type": "object",
            "properties": Value::Object(properties),
            "required": required,
        })
    }

    /// Check `arguments` against this tool's required-field list and declared types.
    /// Returns the name of the first missing-or-mistyped field.
    fn validate(&self, arguments: &HashMap<String, Value>) -> Result<(), String> {
        for param in &self.parameters {
            match arguments.get(&param.name) {
                Some(value) => {
                    if !param.param_type.accepts(value) {
                        return Err(format!(
                            "field '{}' must be of type {}",
                            param.name,
                            param.param_type.as_json_schema_name()
                        ));
                    }
                }
                None if param.required => {
                    return Err(format!("missing required field '{}'", param.name));
                }
                None => {}
            }
        }
        Ok(())
    }
}

/// Errors a tool invocation can fail with. Distinct from [`super::errors::OrchestratorError`]:
/// these stay at the subtask/tool-call level and never abort a request (spec §7).
#[derive(Debug, Clone)]
pub enum ToolError {
    NotFound(String),
    InvalidArguments(String),
    ExecutionFailed(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::NotFound(name) => write!(f, "Tool not found: {name}"),
            ToolError::InvalidArguments(detail) => write!(f, "Invalid parameters: {detail}"),
            ToolError::ExecutionFailed(msg) => write!(f, "Tool execution failed: {msg}"),
        }
    }
}

impl Error for ToolError {}

/// The behavior every tool implements: execute against a context and named arguments,
/// returning a [`super::types::ToolResult`] value rather than propagating a panic.
#[async_trait]
pub trait ToolProtocol: Send + Sync {
    async fn execute(
        &self,
        ctx: &super::types::AgentContext,
        arguments: HashMap<String, Value>,
    ) -> super::types::ToolResult;
}

/// A tool bound to its metadata and executing protocol.
pub struct Tool {
    metadata: ToolMetadata,
    protocol: Arc<dyn ToolProtocol>,
}

impl Tool {
    pub fn new(metadata: ToolMetadata, protocol: Arc<dyn ToolProtocol>) -> Self {
        Self { metadata, protocol }
    }

    pub fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Validate `arguments` against this tool's schema, then execute.
    pub async fn invoke(
        &self,
        ctx: &super::types::AgentContext,
        arguments: HashMap<String, Value>,
    ) -> Result<super::types::ToolResult, ToolError> {
        self.metadata
            .validate(&arguments)
            .map_err(ToolError::InvalidArguments)?;
        Ok(self.protocol.execute(ctx, arguments).await)
    }
}

/// Per-[`AgentKind`] default tool allowlist (spec §4.1), expressed as data rather than a
/// branching match in the executor.
pub fn default_tools_for(kind: AgentKind) -> &'static [&'static str] {
    match kind {
        AgentKind::Rag => &["vector_search", "graph_query", "document_read"],
        AgentKind::Ims => &["ims_search", "web_fetch", "vector_search"],
        AgentKind::Vision => &["document_read", "vector_search"],
        AgentKind::Code => &["document_read", "shell", "vector_search"],
        AgentKind::Planner => &["vector_search", "graph_query", "ims_search", "document_read"],
    }
}

/// Process-wide, name-keyed tool catalog. Built once at startup via [`ToolRegistry::register`]
/// calls and treated as read-only thereafter (spec §5 "Shared-resource policy"): lookups never
/// take a lock.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    /// Register a tool under its own name. Idempotent: registering the same name twice
    /// keeps the second registration and logs a warning (spec §4.1, §8 round-trip
    /// property "last-writer-wins").
    pub fn register(&mut self, tool: Tool) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), Arc::new(tool)).is_some() {
            warn!("tool '{name}' re-registered; keeping the latest registration");
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list_all(&self) -> Vec<&ToolMetadata> {
        self.tools.values().map(|t| t.metadata()).collect()
    }

    /// Tools assigned to `kind` by the default table, filtered to those actually
    /// registered (a test registry may only populate a subset).
    pub fn list_for_agent_kind(&self, kind: AgentKind) -> Vec<Arc<Tool>> {
        default_tools_for(kind)
            .iter()
            .filter_map(|name| self.lookup(name))
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentflow::types::{AgentContext, ToolResult};

    struct EchoProtocol;

    #[async_trait]
    impl ToolProtocol for EchoProtocol {
        async fn execute(&self, _ctx: &AgentContext, arguments: HashMap<String, Value>) -> ToolResult {
            ToolResult::success(arguments.get("text").and_then(|v| v.as_str()).unwrap_or("").to_string())
        }
    }

    fn echo_tool() -> Tool {
        let metadata = ToolMetadata::new("echo", "echoes back text")
            .with_parameter(ToolParameter::new("text", ParamType::String).required());
        Tool::new(metadata, Arc::new(EchoProtocol))
    }

    #[test]
    fn last_writer_wins_on_duplicate_registration() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool());
        let mut replacement = ToolMetadata::new("echo", "second registration");
        replacement.parameters.push(ToolParameter::new("text", ParamType::String));
        registry.register(Tool::new(replacement, Arc::new(EchoProtocol)));
        assert_eq!(registry.lookup("echo").unwrap().metadata().description, "second registration");
        assert_eq!(registry.list_all().len(), 1);
    }

    #[tokio::test]
    async fn missing_required_argument_is_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool());
        let tool = registry.lookup("echo").unwrap();
        let ctx = AgentContext::new("sess", 10, 300);
        let err = tool.invoke(&ctx, HashMap::new()).await.unwrap_err();
        match err {
            ToolError::InvalidArguments(detail) => assert!(detail.contains("text")),
            other => panic!("expected InvalidArguments, got {other}"),
        }
    }

    #[tokio::test]
    async fn valid_arguments_execute_the_protocol() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool());
        let tool = registry.lookup("echo").unwrap();
        let ctx = AgentContext::new("sess", 10, 300);
        let mut args = HashMap::new();
        args.insert("text".to_string(), Value::String("hi".to_string()));
        let result = tool.invoke(&ctx, args).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output, "hi");
    }

    #[test]
    fn default_tool_table_is_data_not_branches() {
        assert_eq!(default_tools_for(AgentKind::Rag), ["vector_search", "graph_query", "document_read"]);
        assert_eq!(default_tools_for(AgentKind::Code), ["document_read", "shell", "vector_search"]);
    }
}
