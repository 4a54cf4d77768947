//! Core entities shared by every component: agent identity, per-request context,
//! message and tool-call records, the subtask DAG, and the small configuration
//! structs that tune orchestration behavior.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The closed set of specialized agents the runtime can route work to.
///
/// Routing, the default tool allowlists in [`crate::agentflow::tool_registry`], and the
/// default permission tables in [`crate::agentflow::permissions`] are all keyed off this
/// enum rather than an open string, per the design notes: dynamic dispatch by name stays
/// at the registry boundary, not in the type model.
///
/// # Example
///
/// ```
/// use agentflow::AgentKind;
///
/// let kind: AgentKind = "code".parse().unwrap();
/// assert_eq!(kind, AgentKind::Code);
/// assert_eq!(kind.to_string(), "code");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Rag,
    Ims,
    Vision,
    Code,
    Planner,
}

impl AgentKind {
    /// All agent kinds, in a stable order used for deterministic keyword-tie breaking.
    pub const ALL: [AgentKind; 5] = [
        AgentKind::Rag,
        AgentKind::Ims,
        AgentKind::Vision,
        AgentKind::Code,
        AgentKind::Planner,
    ];
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentKind::Rag => "rag",
            AgentKind::Ims => "ims",
            AgentKind::Vision => "vision",
            AgentKind::Code => "code",
            AgentKind::Planner => "planner",
        };
        f.write_str(s)
    }
}

/// Error returned when a string does not name one of the closed [`AgentKind`] values.
#[derive(Debug, Clone)]
pub struct UnknownAgentKind(pub String);

impl fmt::Display for UnknownAgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown agent kind: {}", self.0)
    }
}
impl std::error::Error for UnknownAgentKind {}

impl FromStr for AgentKind {
    type Err = UnknownAgentKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rag" => Ok(AgentKind::Rag),
            "ims" => Ok(AgentKind::Ims),
            "vision" => Ok(AgentKind::Vision),
            "code" => Ok(AgentKind::Code),
            "planner" => Ok(AgentKind::Planner),
            other => Err(UnknownAgentKind(other.to_string())),
        }
    }
}

/// The role of a message within an agent's conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A call to a named tool with its arguments, carrying a caller-assigned id so the
/// resulting [`AgentMessage`] of role [`MessageRole::Tool`] can be correlated back to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: HashMap<String, Value>,
}

/// A role-tagged record in an agent's running conversation.
///
/// `tool_call_id` and `name` are only populated on [`MessageRole::Tool`] messages,
/// mirroring the wire shape of the Chat LLM contract in spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl AgentMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
        }
    }
}

/// The outcome of invoking a single tool.
///
/// `metadata` may carry a `"sources"` array, which the agent executor lifts into the
/// final [`AgentResult::sources`] list (spec §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ToolResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            metadata: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A deduplicated (by `source` field) piece of provenance surfaced by a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// Maximum number of deduplicated sources carried on an [`AgentResult`] (spec §4.6, §8 property 7).
pub const MAX_SOURCES: usize = 10;

/// The terminal outcome of one agent executor run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub answer: String,
    pub agent_kind: AgentKind,
    pub steps: usize,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
    pub sources: Vec<Source>,
    pub execution_time_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentResult {
    pub fn failed(agent_kind: AgentKind, error: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            answer: String::new(),
            agent_kind,
            steps: 0,
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            sources: Vec::new(),
            execution_time_ms,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Status of a [`SubTask`] within a [`TaskDAG`].
///
/// Transitions are monotone: `Pending -> Running -> {Completed, Failed, Skipped}`.
/// Once terminal, a status never changes (spec §8 invariant 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubTaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl SubTaskStatus {
    /// Whether this is one of the three terminal states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SubTaskStatus::Completed | SubTaskStatus::Failed | SubTaskStatus::Skipped
        )
    }
}

/// A single node in a [`TaskDAG`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub id: String,
    pub description: String,
    pub agent_kind: AgentKind,
    pub dependencies: Vec<String>,
    pub status: SubTaskStatus,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_override: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<AgentResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl SubTask {
    pub fn new(id: impl Into<String>, description: impl Into<String>, agent_kind: AgentKind) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            agent_kind,
            dependencies: Vec::new(),
            status: SubTaskStatus::Pending,
            retry_count: 0,
            timeout_override: None,
            result: None,
            error: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Whether this subtask is tagged as a synthesis node by the rule-based DAG Builder
    /// (spec §4.4 "Without LLM for compare-style tasks", honored per §4.8 step 9).
    pub fn is_synthesis(&self) -> bool {
        matches!(self.metadata.get("is_synthesis"), Some(Value::Bool(true)))
    }

    pub fn mark_synthesis(&mut self) {
        self.metadata.insert("is_synthesis".to_string(), Value::Bool(true));
    }

    /// Transition this subtask's status, refusing to move out of a terminal state.
    pub fn transition(&mut self, next: SubTaskStatus) {
        if self.status.is_terminal() {
            return;
        }
        self.status = next;
    }
}

/// How a [`TaskDAG`]'s batches may be executed relative to one another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParallelismKind {
    None,
    Full,
    Partial,
    Pipeline,
}

/// A validated directed acyclic graph of subtasks plus its precomputed topological
/// batches.
///
/// Invariants (checked by [`crate::agentflow::dag::DagBuilder::validate`], spec §3, §8):
/// every dependency referenced by a task exists in the same DAG; the union of all
/// batches equals the task-id set exactly; within a batch no task depends on another
/// task in the same batch; batches are topologically ordered; the DAG is acyclic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDAG {
    pub root_task: String,
    pub tasks: HashMap<String, SubTask>,
    pub batches: Vec<Vec<String>>,
    pub parallelism: ParallelismKind,
}

impl TaskDAG {
    /// A single-node DAG pointing at `agent_kind`, used by the builder's short-circuit
    /// path and as the orchestrator's fallback when a built DAG fails validation.
    pub fn single_task(task_text: &str, id: impl Into<String>, agent_kind: AgentKind) -> Self {
        let id = id.into();
        let mut tasks = HashMap::new();
        tasks.insert(id.clone(), SubTask::new(id.clone(), task_text, agent_kind));
        Self {
            root_task: task_text.to_string(),
            tasks,
            batches: vec![vec![id]],
            parallelism: ParallelismKind::None,
        }
    }

    pub fn batch_index_of(&self, task_id: &str) -> Option<usize> {
        self.batches.iter().position(|batch| batch.iter().any(|t| t == task_id))
    }
}

/// Per-request state threaded through orchestration.
///
/// Created by the orchestrator, shared read-only by all subtasks of the same request;
/// per-subtask variants are produced by shallow clone + extension of `file_context`
/// (spec §5 "AgentContext is copy-on-extend").
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub session_id: String,
    pub user_id: Option<String>,
    pub max_steps: usize,
    pub deadline: DateTime<Utc>,
    pub language: String,
    pub history: Vec<(String, String)>,
    pub file_context: String,
    pub url_context: Option<String>,
    pub intent: Option<crate::agentflow::intent::IntentResult>,
}

impl AgentContext {
    pub fn new(session_id: impl Into<String>, max_steps: usize, timeout_secs: i64) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: None,
            max_steps,
            deadline: Utc::now() + chrono::Duration::seconds(timeout_secs),
            language: "auto".to_string(),
            history: Vec::new(),
            file_context: String::new(),
            url_context: None,
            intent: None,
        }
    }

    /// Build a per-subtask context: a shallow clone with `extra_context` prepended to
    /// `file_context` (spec §4.5 step 1).
    pub fn extended_with(&self, extra_context: &str) -> Self {
        let mut ctx = self.clone();
        if extra_context.is_empty() {
            return ctx;
        }
        ctx.file_context = if ctx.file_context.is_empty() {
            extra_context.to_string()
        } else {
            format!("{}\n\n{}", extra_context, ctx.file_context)
        };
        ctx
    }
}

/// Toggles and limits controlling one orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    pub enable_multi_agent: bool,
    pub enable_parallel: bool,
    pub enable_evaluation: bool,
    pub enable_retry: bool,
    pub enable_next_actions: bool,
    pub continue_on_failure: bool,
    pub timeout_overrides: HashMap<AgentKind, u64>,
    pub evaluation_criteria: EvaluationCriteria,
    pub retry_config: RetryConfig,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            enable_multi_agent: true,
            enable_parallel: true,
            enable_evaluation: true,
            enable_retry: true,
            enable_next_actions: true,
            continue_on_failure: true,
            timeout_overrides: HashMap::new(),
            evaluation_criteria: EvaluationCriteria::default(),
            retry_config: RetryConfig::default(),
        }
    }
}

impl OrchestrationConfig {
    pub fn with_timeout_override(mut self, kind: AgentKind, seconds: u64) -> Self {
        self.timeout_overrides.insert(kind, seconds);
        self
    }
}

/// Thresholds the [`crate::agentflow::evaluator::Evaluator`] scores a result against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationCriteria {
    pub min_confidence: f64,
    pub min_answer_length: usize,
    pub require_sources: bool,
    pub max_execution_time_ms: Option<u64>,
}

impl Default for EvaluationCriteria {
    fn default() -> Self {
        Self {
            min_confidence: 0.6,
            min_answer_length: 10,
            require_sources: false,
            max_execution_time_ms: None,
        }
    }
}

/// Retry policy consulted by the evaluator and executed by the parallel executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub retry_on_failure: bool,
    pub retry_on_low_quality: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 500,
            backoff_factor: 2.0,
            retry_on_failure: true,
            retry_on_low_quality: true,
        }
    }
}

impl RetryConfig {
    /// Delay before the `retry_count`-th retry: `initial_delay * backoff_factor^retry_count`.
    pub fn delay_for(&self, retry_count: u32) -> std::time::Duration {
        let ms = self.initial_delay_ms as f64 * self.backoff_factor.powi(retry_count as i32);
        std::time::Duration::from_millis(ms.round() as u64)
    }
}

/// The outcome of evaluating one [`AgentResult`] or a synthesized answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub passed: bool,
    pub score: f64,
    pub issues: Vec<String>,
    pub retry_recommended: bool,
    pub retry_reason: Option<String>,
}

/// One entry the Query Log Writer batches (spec §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLogRecord {
    pub normalized_query: String,
    pub query_hash: String,
    pub session_id: String,
    pub user_id: Option<String>,
    pub agent_kinds: Vec<AgentKind>,
    pub success: bool,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_kind_round_trips_through_display_and_from_str() {
        for kind in AgentKind::ALL {
            let parsed: AgentKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn unknown_agent_kind_is_rejected() {
        assert!("nonsense".parse::<AgentKind>().is_err());
    }

    #[test]
    fn subtask_status_does_not_leave_terminal_states() {
        let mut task = SubTask::new("t1", "do a thing", AgentKind::Rag);
        task.transition(SubTaskStatus::Running);
        task.transition(SubTaskStatus::Completed);
        assert_eq!(task.status, SubTaskStatus::Completed);
        task.transition(SubTaskStatus::Failed);
        assert_eq!(task.status, SubTaskStatus::Completed, "terminal status must not change");
    }

    #[test]
    fn context_extension_prepends_without_mutating_original() {
        let base = AgentContext::new("sess-1", 10, 300);
        let extended = base.extended_with("[Result from previous task t1]\nPython is a language.");
        assert!(extended.file_context.starts_with("[Result from previous task t1]"));
        assert!(base.file_context.is_empty());
    }

    #[test]
    fn retry_delay_grows_with_backoff() {
        let cfg = RetryConfig::default();
        assert!(cfg.delay_for(1) > cfg.delay_for(0));
    }
}
