// src/lib.rs

//! `agentflow` is a multi-agent orchestration runtime for knowledge-base question
//! answering. A caller submits a task in natural language; the runtime classifies
//! intent, decomposes the task into a directed acyclic graph of subtasks, dispatches
//! each subtask to a specialized agent running a Reason-Act loop over a tool
//! registry, executes independent subtasks in parallel with per-agent timeouts,
//! evaluates results, optionally retries, and synthesizes a single answer.
//!
//! See [`orchestrator::Orchestrator`] for the entry point.

pub mod agentflow;

pub use agentflow::client::{ChatLlm, Message, Role, TokenUsage, ToolDefinition};
pub use agentflow::errors::{AppMode, OrchestratorError};
pub use agentflow::orchestrator::{
    OrchestrationChunk, OrchestrationRequest, OrchestrationResponse, Orchestrator, OrchestratorBuilder,
};
pub use agentflow::types::{
    AgentContext, AgentKind, AgentMessage, AgentResult, EvaluationCriteria, EvaluationResult,
    OrchestrationConfig, RetryConfig, SubTask, SubTaskStatus, TaskDAG, ToolCall, ToolResult,
};
