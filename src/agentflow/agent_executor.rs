//! Agent Executor: the Reason-Act loop (spec §4.6).
//!
//! Grounded on `agent.rs`'s `Agent::send` tool loop (iteration cap, tool-call parsing,
//! event emission), generalized from the teacher's hardcoded 5-iteration cap to the
//! spec's `max_steps` budget (default 10, hard cap 50) and extended with the
//! `DOOM_LOOP_THRESHOLD = 3` repeated-signature guard the teacher has no analog for.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};
use serde_json::Value;
use tokio::sync::mpsc;

use super::agent_registry::AgentRegistry;
use super::client::{ChatLlm, Message as LlmMessage, NativeToolCall, Role as LlmRole, ToolDefinition};
use super::config::{DOOM_LOOP_THRESHOLD, HARD_CAP_MAX_STEPS};
use super::permissions::PermissionManager;
use super::tool_registry::{ToolError, ToolRegistry};
use super::types::{
    AgentContext, AgentKind, AgentMessage, AgentResult, MessageRole, Source, ToolCall, ToolResult, MAX_SOURCES,
};

/// A first-class artifact chunk kind, kept out of the plain-text stream (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactType {
    Code,
    Markdown,
    Html,
    Json,
    Diff,
    Log,
    Text,
}

/// One chunk of the Agent Executor's streaming variant.
#[derive(Debug, Clone)]
pub enum AgentStreamChunk {
    Thinking,
    ToolCall { name: String, input: Value },
    ToolResult { name: String, output: String },
    Text { text: String },
    Sources { sources: Vec<Source> },
    Artifact { id: String, artifact_type: ArtifactType, title: String, language: Option<String> },
    Done { result: AgentResult },
}

/// Text fragment size and pacing for the streaming variant's `text` chunks (spec §4.6).
const TEXT_CHUNK_LEN: usize = 50;
const TEXT_CHUNK_PACING_MS: u64 = 20;
/// `tool_result` chunks are truncated to this many characters before streaming (spec §4.6).
const TOOL_RESULT_PREVIEW_LEN: usize = 500;
/// How many trailing conversation-history turns are replayed into the message list
/// (spec §4.6 step 1: "up to last 5 conversation-history turns").
const HISTORY_TURNS: usize = 5;

/// Resource string the permission manager evaluates a tool call's resource-pattern
/// rules against: the shell command, the fetched URL, or a wildcard for tools with no
/// natural single resource argument.
fn resource_for(tool_name: &str, arguments: &HashMap<String, Value>) -> String {
    match tool_name {
        "shell" => arguments.get("command").and_then(|v| v.as_str()).unwrap_or("*").to_string(),
        "web_fetch" => arguments.get("url").and_then(|v| v.as_str()).unwrap_or("*").to_string(),
        _ => "*".to_string(),
    }
}

/// A canonical signature for doom-loop detection: the tool name plus its arguments
/// serialized with sorted keys, so semantically identical calls compare equal
/// regardless of map iteration order.
fn call_signature(tool_name: &str, arguments: &HashMap<String, Value>) -> String {
    let sorted: std::collections::BTreeMap<&String, &Value> = arguments.iter().collect();
    format!("{tool_name}:{}", serde_json::to_string(&sorted).unwrap_or_default())
}

fn native_to_tool_call(native: NativeToolCall) -> ToolCall {
    let arguments = match native.arguments {
        Value::Object(map) => map.into_iter().collect(),
        Value::String(s) => serde_json::from_str::<Value>(&s)
            .ok()
            .and_then(|v| v.as_object().cloned())
            .map(|m| m.into_iter().collect())
            .unwrap_or_default(),
        _ => HashMap::new(),
    };
    ToolCall { id: native.id, name: native.name, arguments }
}

fn tool_call_to_native(call: &ToolCall) -> NativeToolCall {
    NativeToolCall {
        id: call.id.clone(),
        name: call.name.clone(),
        arguments: serde_json::to_value(&call.arguments).unwrap_or(Value::Null),
    }
}

/// Runs the Reason-Act loop for a single (agent, task, context) triple.
pub struct AgentExecutor {
    llm: Arc<dyn ChatLlm>,
    tool_registry: Arc<ToolRegistry>,
    agent_registry: Arc<AgentRegistry>,
    permissions: Arc<PermissionManager>,
}

impl AgentExecutor {
    pub fn new(
        llm: Arc<dyn ChatLlm>,
        tool_registry: Arc<ToolRegistry>,
        agent_registry: Arc<AgentRegistry>,
        permissions: Arc<PermissionManager>,
    ) -> Self {
        Self { llm, tool_registry, agent_registry, permissions }
    }

    fn build_initial_messages(&self, agent_kind: AgentKind, task: &str, ctx: &AgentContext) -> Vec<AgentMessage> {
        let profile = self.agent_registry.get(agent_kind);
        let mut messages = vec![AgentMessage::system(profile.system_prompt.clone())];
        for (user_turn, assistant_turn) in ctx.history.iter().rev().take(HISTORY_TURNS).rev() {
            messages.push(AgentMessage::user(user_turn.clone()));
            messages.push(AgentMessage::assistant(assistant_turn.clone(), Vec::new()));
        }
        let mut task_with_context = task.to_string();
        if !ctx.file_context.is_empty() {
            task_with_context = format!("{}\n\n{task_with_context}", ctx.file_context);
        }
        messages.push(AgentMessage::user(task_with_context));
        messages
    }

    fn tool_definitions(&self, agent_kind: AgentKind) -> Vec<ToolDefinition> {
        self.agent_registry
            .get(agent_kind)
            .tools
            .iter()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.metadata().description.clone(),
                parameters_schema: tool.metadata().json_schema(),
            })
            .collect()
    }

    async fn call_llm(&self, messages: &[AgentMessage], tools: Vec<ToolDefinition>) -> Result<AgentMessage, String> {
        let llm_messages: Vec<LlmMessage> = messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    MessageRole::System => LlmRole::System,
                    MessageRole::User => LlmRole::User,
                    MessageRole::Assistant => LlmRole::Assistant,
                    MessageRole::Tool => LlmRole::Tool { call_id: m.tool_call_id.clone().unwrap_or_default() },
                };
                let tool_calls = if m.role == MessageRole::Assistant {
                    m.tool_calls.iter().map(tool_call_to_native).collect()
                } else {
                    Vec::new()
                };
                LlmMessage { role, content: m.content.clone().into(), tool_calls }
            })
            .collect();
        let response = self
            .llm
            .generate(&llm_messages, Some(tools), None)
            .await
            .map_err(|e| e.to_string())?;
        let tool_calls: Vec<ToolCall> = response.tool_calls.into_iter().map(native_to_tool_call).collect();
        Ok(AgentMessage::assistant(response.content.to_string(), tool_calls))
    }

    /// Invoke one tool call through the permission manager and the tool registry,
    /// returning both the [`ToolResult`] (for bookkeeping) and the message appended to
    /// the running conversation.
    async fn act(&self, agent_kind: AgentKind, ctx: &AgentContext, call: &ToolCall) -> (ToolResult, AgentMessage) {
        let resource = resource_for(&call.name, &call.arguments);
        if !self.permissions.check(&call.name, agent_kind, ctx.user_id.as_deref(), &resource) {
            let msg = format!("Permission denied for tool: {}", call.name);
            warn!("{msg}");
            let result = ToolResult::failure(msg.clone());
            return (result, AgentMessage::tool(msg, call.id.clone(), call.name.clone()));
        }

        let Some(tool) = self.tool_registry.lookup(&call.name) else {
            let msg = ToolError::NotFound(call.name.clone()).to_string();
            let result = ToolResult::failure(msg.clone());
            return (result, AgentMessage::tool(format!("Error: {msg}"), call.id.clone(), call.name.clone()));
        };

        match tool.invoke(ctx, call.arguments.clone()).await {
            Ok(result) => {
                let content = if result.success { result.output.clone() } else { format!("Error: {}", result.error.clone().unwrap_or_default()) };
                (result, AgentMessage::tool(content, call.id.clone(), call.name.clone()))
            }
            Err(err) => {
                let msg = err.to_string();
                let result = ToolResult::failure(msg.clone());
                (result, AgentMessage::tool(format!("Error: {msg}"), call.id.clone(), call.name.clone()))
            }
        }
    }

    /// Extract and deduplicate sources from a list of tool results (spec §4.6): lift
    /// `metadata.sources`, and opportunistically parse `output` as JSON looking for a
    /// `results[].source` shape too.
    fn extract_sources(tool_results: &[ToolResult]) -> Vec<Source> {
        let mut sources = Vec::new();
        let mut seen = std::collections::HashSet::new();

        let mut push = |value: &Value, sources: &mut Vec<Source>, seen: &mut std::collections::HashSet<String>| {
            let Some(source) = value.get("source").and_then(|v| v.as_str()) else { return };
            if !seen.insert(source.to_string()) {
                return;
            }
            sources.push(Source {
                source: source.to_string(),
                content: value.get("content").and_then(|v| v.as_str()).map(str::to_string),
                score: value.get("score").and_then(|v| v.as_f64()),
            });
        };

        for result in tool_results {
            if !result.success {
                continue;
            }
            if let Some(metadata) = &result.metadata {
                if let Some(list) = metadata.get("sources").and_then(|v| v.as_array()) {
                    for entry in list {
                        push(entry, &mut sources, &mut seen);
                    }
                }
            }
            if let Ok(parsed) = serde_json::from_str::<Value>(&result.output) {
                if let Some(list) = parsed.get("results").and_then(|v| v.as_array()) {
                    for entry in list {
                        push(entry, &mut sources, &mut seen);
                    }
                }
            }
        }
        sources.truncate(MAX_SOURCES);
        sources
    }

    /// Run the loop to completion and return the terminal [`AgentResult`] (unary path).
    pub async fn run(&self, agent_kind: AgentKind, task: &str, ctx: &AgentContext) -> AgentResult {
        let start = Instant::now();
        let max_steps = ctx.max_steps.min(HARD_CAP_MAX_STEPS);
        let mut messages = self.build_initial_messages(agent_kind, task, ctx);
        let tools = self.tool_definitions(agent_kind);

        if max_steps == 0 {
            // Boundary: a zero step budget still allows one model turn, just no tool
            // execution - the loop below would never get to call it otherwise.
            let answer = match self.call_llm(&messages, tools).await {
                Ok(msg) => msg.content,
                Err(e) => return AgentResult::failed(agent_kind, format!("Execution failed: {e}"), start.elapsed().as_millis() as u64),
            };
            return AgentResult {
                answer,
                agent_kind,
                steps: 0,
                tool_calls: Vec::new(),
                tool_results: Vec::new(),
                sources: Vec::new(),
                execution_time_ms: start.elapsed().as_millis() as u64,
                success: true,
                error: None,
            };
        }

        let mut recent_signatures: VecDeque<String> = VecDeque::with_capacity(DOOM_LOOP_THRESHOLD);
        let mut all_tool_calls = Vec::new();
        let mut all_tool_results = Vec::new();
        let mut steps = 0usize;

        loop {
            if steps >= max_steps {
                break;
            }
            let assistant = match self.call_llm(&messages, tools.clone()).await {
                Ok(msg) => msg,
                Err(e) => {
                    return AgentResult::failed(agent_kind, format!("Execution failed: {e}"), start.elapsed().as_millis() as u64);
                }
            };

            if assistant.tool_calls.is_empty() {
                steps += 1;
                let sources = Self::extract_sources(&all_tool_results);
                return AgentResult {
                    answer: assistant.content,
                    agent_kind,
                    steps,
                    tool_calls: all_tool_calls,
                    tool_results: all_tool_results,
                    sources,
                    execution_time_ms: start.elapsed().as_millis() as u64,
                    success: true,
                    error: None,
                };
            }

            let mut doom_looped = false;
            for call in &assistant.tool_calls {
                let signature = call_signature(&call.name, &call.arguments);
                if recent_signatures.len() == DOOM_LOOP_THRESHOLD {
                    recent_signatures.pop_front();
                }
                recent_signatures.push_back(signature);
                if recent_signatures.len() == DOOM_LOOP_THRESHOLD
                    && recent_signatures.iter().all(|s| s == recent_signatures.back().unwrap())
                {
                    doom_looped = true;
                    break;
                }
            }

            messages.push(assistant.clone());
            steps += 1;

            for call in &assistant.tool_calls {
                let (result, message) = self.act(agent_kind, ctx, call).await;
                all_tool_calls.push(call.clone());
                all_tool_results.push(result);
                messages.push(message);
            }

            if doom_looped {
                debug!("agent executor: doom-loop guard tripped after {} identical tool-call signatures", DOOM_LOOP_THRESHOLD);
                let fallback = if assistant.content.trim().is_empty() {
                    "no conclusive answer could be reached".to_string()
                } else {
                    assistant.content.clone()
                };
                let sources = Self::extract_sources(&all_tool_results);
                return AgentResult {
                    answer: format!("I noticed I was repeating the same action. Based on the information gathered: {fallback}"),
                    agent_kind,
                    steps,
                    tool_calls: all_tool_calls,
                    tool_results: all_tool_results,
                    sources,
                    execution_time_ms: start.elapsed().as_millis() as u64,
                    success: true,
                    error: None,
                };
            }
        }

        let sources = Self::extract_sources(&all_tool_results);
        AgentResult {
            answer: "Reached the maximum number of reasoning steps without a conclusive answer.".to_string(),
            agent_kind,
            steps,
            tool_calls: all_tool_calls,
            tool_results: all_tool_results,
            sources,
            execution_time_ms: start.elapsed().as_millis() as u64,
            success: true,
            error: None,
        }
    }

    /// Streaming variant of [`Self::run`]: spawns the loop as a background task and
    /// returns the receiving half of an unbounded channel (spec §5 "the interleaving
    /// stream channel is unbounded in this design").
    pub fn stream(self: Arc<Self>, agent_kind: AgentKind, task: String, ctx: AgentContext) -> mpsc::UnboundedReceiver<AgentStreamChunk> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let result = self.run_streaming(agent_kind, &task, &ctx, &tx).await;
            let _ = tx.send(AgentStreamChunk::Done { result });
        });
        rx
    }

    async fn run_streaming(
        &self,
        agent_kind: AgentKind,
        task: &str,
        ctx: &AgentContext,
        tx: &mpsc::UnboundedSender<AgentStreamChunk>,
    ) -> AgentResult {
        let start = Instant::now();
        let max_steps = ctx.max_steps.min(HARD_CAP_MAX_STEPS);
        let mut messages = self.build_initial_messages(agent_kind, task, ctx);
        let tools = self.tool_definitions(agent_kind);
        let mut all_tool_calls = Vec::new();
        let mut all_tool_results = Vec::new();
        let mut recent_signatures: VecDeque<String> = VecDeque::with_capacity(DOOM_LOOP_THRESHOLD);
        let mut steps = 0usize;

        loop {
            if steps >= max_steps {
                break;
            }
            let _ = tx.send(AgentStreamChunk::Thinking);
            let assistant = match self.call_llm(&messages, tools.clone()).await {
                Ok(msg) => msg,
                Err(e) => {
                    return AgentResult::failed(agent_kind, format!("Execution failed: {e}"), start.elapsed().as_millis() as u64);
                }
            };

            if assistant.tool_calls.is_empty() {
                steps += 1;
                self.stream_text(tx, &assistant.content).await;
                let sources = Self::extract_sources(&all_tool_results);
                let _ = tx.send(AgentStreamChunk::Sources { sources: sources.clone() });
                return AgentResult {
                    answer: assistant.content,
                    agent_kind,
                    steps,
                    tool_calls: all_tool_calls,
                    tool_results: all_tool_results,
                    sources,
                    execution_time_ms: start.elapsed().as_millis() as u64,
                    success: true,
                    error: None,
                };
            }

            messages.push(assistant.clone());
            steps += 1;

            let mut doom_looped = false;
            for call in &assistant.tool_calls {
                let signature = call_signature(&call.name, &call.arguments);
                if recent_signatures.len() == DOOM_LOOP_THRESHOLD {
                    recent_signatures.pop_front();
                }
                recent_signatures.push_back(signature);
                if recent_signatures.len() == DOOM_LOOP_THRESHOLD
                    && recent_signatures.iter().all(|s| s == recent_signatures.back().unwrap())
                {
                    doom_looped = true;
                }

                let _ = tx.send(AgentStreamChunk::ToolCall {
                    name: call.name.clone(),
                    input: serde_json::to_value(&call.arguments).unwrap_or(Value::Null),
                });
                let (result, message) = self.act(agent_kind, ctx, call).await;
                let preview: String = result.output.chars().take(TOOL_RESULT_PREVIEW_LEN).collect();
                let _ = tx.send(AgentStreamChunk::ToolResult { name: call.name.clone(), output: preview });
                all_tool_calls.push(call.clone());
                all_tool_results.push(result);
                messages.push(message);

                if doom_looped {
                    break;
                }
            }

            if doom_looped {
                let fallback = if assistant.content.trim().is_empty() { "no conclusive answer could be reached".to_string() } else { assistant.content.clone() };
                let answer = format!("I noticed I was repeating the same action. Based on the information gathered: {fallback}");
                self.stream_text(tx, &answer).await;
                let sources = Self::extract_sources(&all_tool_results);
                let _ = tx.send(AgentStreamChunk::Sources { sources: sources.clone() });
                return AgentResult {
                    answer,
                    agent_kind,
                    steps,
                    tool_calls: all_tool_calls,
                    tool_results: all_tool_results,
                    sources,
                    execution_time_ms: start.elapsed().as_millis() as u64,
                    success: true,
                    error: None,
                };
            }
        }

        let answer = "Reached the maximum number of reasoning steps without a conclusive answer.".to_string();
        self.stream_text(tx, &answer).await;
        let sources = Self::extract_sources(&all_tool_results);
        let _ = tx.send(AgentStreamChunk::Sources { sources: sources.clone() });
        AgentResult {
            answer,
            agent_kind,
            steps,
            tool_calls: all_tool_calls,
            tool_results: all_tool_results,
            sources,
            execution_time_ms: start.elapsed().as_millis() as u64,
            success: true,
            error: None,
        }
    }

    async fn stream_text(&self, tx: &mpsc::UnboundedSender<AgentStreamChunk>, text: &str) {
        let chars: Vec<char> = text.chars().collect();
        for chunk in chars.chunks(TEXT_CHUNK_LEN) {
            let _ = tx.send(AgentStreamChunk::Text { text: chunk.iter().collect() });
            tokio::time::sleep(std::time::Duration::from_millis(TEXT_CHUNK_PACING_MS)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentflow::client::{Message as LlmMsg, TokenUsage};
    use crate::agentflow::tools::populate_default_registry;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct ScriptedLlm {
        responses: StdMutex<VecDeque<LlmMsg>>,
        calls: AtomicUsize,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<LlmMsg>) -> Self {
            Self { responses: StdMutex::new(responses.into()), calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl ChatLlm for ScriptedLlm {
        async fn generate(
            &self,
            _messages: &[LlmMsg],
            _tools: Option<Vec<ToolDefinition>>,
            _temperature: Option<f32>,
        ) -> Result<LlmMsg, Box<dyn std::error::Error + Send + Sync>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            Ok(responses.pop_front().unwrap_or_else(|| LlmMsg::user("no more scripted responses")))
        }

        fn model_name(&self) -> &str {
            "scripted"
        }

        fn usage_slot(&self) -> Option<&tokio::sync::Mutex<Option<TokenUsage>>> {
            None
        }
    }

    fn tool_call_message(name: &str, args: serde_json::Value) -> LlmMsg {
        LlmMsg {
            role: super::LlmRole::Assistant,
            content: "".into(),
            tool_calls: vec![NativeToolCall { id: "call-1".to_string(), name: name.to_string(), arguments: args }],
        }
    }

    fn build_executor(llm: Arc<dyn ChatLlm>) -> Arc<AgentExecutor> {
        let mut tool_registry = ToolRegistry::new();
        populate_default_registry(&mut tool_registry);
        let tool_registry = Arc::new(tool_registry);
        let agent_registry = Arc::new(AgentRegistry::from_tool_registry(&tool_registry));
        let permissions = Arc::new(PermissionManager::with_defaults());
        Arc::new(AgentExecutor::new(llm, tool_registry, agent_registry, permissions))
    }

    #[tokio::test]
    async fn happy_path_single_tool_call_then_final_answer() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            tool_call_message("vector_search", serde_json::json!({ "text": "python" })),
            LlmMsg::user("Python is a programming language (doc1#c3)."),
        ]));
        let executor = build_executor(llm);
        let ctx = AgentContext::new("sess-1", 10, 300);
        let result = executor.run(AgentKind::Rag, "What is Python?", &ctx).await;
        assert!(result.success);
        assert_eq!(result.steps, 2);
        assert!(!result.sources.is_empty());
    }

    #[tokio::test]
    async fn max_steps_zero_returns_first_turn_without_executing_tools() {
        let llm = Arc::new(ScriptedLlm::new(vec![tool_call_message("vector_search", serde_json::json!({ "text": "x" }))]));
        let executor = build_executor(llm);
        let mut ctx = AgentContext::new("sess-1", 0, 300);
        ctx.max_steps = 0;
        let result = executor.run(AgentKind::Rag, "anything", &ctx).await;
        assert_eq!(result.steps, 0);
        assert!(result.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn doom_loop_terminates_after_three_identical_calls() {
        let repeated = tool_call_message("vector_search", serde_json::json!({ "q": "x" }));
        let llm = Arc::new(ScriptedLlm::new(vec![repeated.clone(), repeated.clone(), repeated, LlmMsg::user("should not be reached")]));
        let executor = build_executor(llm);
        let ctx = AgentContext::new("sess-1", 10, 300);
        let result = executor.run(AgentKind::Rag, "loop forever", &ctx).await;
        assert!(result.answer.starts_with("I noticed I was repeating the same action."));
        assert!(result.steps <= 4);
    }

    #[tokio::test]
    async fn permission_denied_tool_is_never_invoked() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            tool_call_message("shell", serde_json::json!({ "command": "rm -rf /" })),
            LlmMsg::user("I could not run that command."),
        ]));
        let executor = build_executor(llm);
        let ctx = AgentContext::new("sess-1", 10, 300);
        let result = executor.run(AgentKind::Code, "delete everything", &ctx).await;
        assert!(result.success);
        assert!(result.tool_results[0].error.as_ref().unwrap().contains("Permission denied"));
    }
}
