//! Parallel Executor (spec §4.5): batch-by-batch DAG dispatch, per-task timeouts,
//! dependency-context propagation, and retry wiring.
//!
//! Grounded on `orchestration.rs`'s `execute_parallel` (`tokio::spawn`-per-agent fan-out,
//! join-and-collect, continue-on-individual-failure) generalized from flat mode dispatch
//! to DAG-batch dispatch; `original_source/app/api/agents/parallel_executor.py` for the
//! exact timeout-resolution order, the dependency-context prepending format, and the
//! retry loop ("actual retry is handled in parallel_executor" per that source's own
//! comment — the Evaluator only *recommends*, this module decides and re-executes).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use serde_json::json;
use tokio::sync::mpsc;

use super::agent_executor::{AgentExecutor, AgentStreamChunk};
use super::config::RuntimeConfig;
use super::evaluator::Evaluator;
use super::trace::TraceContext;
use super::types::{AgentContext, AgentResult, OrchestrationConfig, SubTask, SubTaskStatus, TaskDAG};

/// Per-dependency answer snippet length carried into a downstream subtask's context
/// (spec §4.5 step 1).
const DEPENDENCY_CONTEXT_CHARS: usize = 2000;

/// Build the `[Result from previous task <id>]\n<answer>` block a subtask's dependencies
/// contribute to its context, joined with a blank line between entries (spec §4.5).
fn build_dependency_context(subtask: &SubTask, completed: &HashMap<String, AgentResult>) -> String {
    let mut parts = Vec::new();
    for dep_id in &subtask.dependencies {
        let Some(result) = completed.get(dep_id) else { continue };
        if !result.success || result.answer.is_empty() {
            continue;
        }
        let snippet: String = result.answer.chars().take(DEPENDENCY_CONTEXT_CHARS).collect();
        parts.push(format!("[Result from previous task {dep_id}]\n{snippet}"));
    }
    parts.join("\n\n")
}

/// Resolve a subtask's timeout: its own override wins, then the per-request config's
/// override table, then the process-wide default table (spec §4.5 step 2).
fn resolve_timeout(subtask: &SubTask, config: &OrchestrationConfig, runtime_config: &RuntimeConfig) -> u64 {
    subtask
        .timeout_override
        .or_else(|| config.timeout_overrides.get(&subtask.agent_kind).copied())
        .unwrap_or_else(|| runtime_config.resolve_timeout(subtask.agent_kind, None))
}

/// Run one execution attempt of `subtask` under its resolved deadline, supervised by its
/// own `tokio::spawn`'d task so a panic inside the Reason-Act loop cannot take the whole
/// batch down with it.
async fn execute_single(agent_executor: &Arc<AgentExecutor>, subtask: &SubTask, ctx: AgentContext, timeout_secs: u64) -> AgentResult {
    let description = subtask.description.clone();
    let kind = subtask.agent_kind;
    let executor = Arc::clone(agent_executor);
    let handle = tokio::spawn(async move { tokio::time::timeout(Duration::from_secs(timeout_secs), executor.run(kind, &description, &ctx)).await });

    match handle.await {
        Ok(Ok(result)) => result,
        Ok(Err(_elapsed)) => AgentResult::failed(kind, format!("Task timed out after {timeout_secs}s"), timeout_secs * 1000),
        Err(join_err) => AgentResult::failed(kind, format!("Execution failed: {join_err}"), 0),
    }
}

/// What to do with a subtask after one execution attempt has produced a result.
enum AttemptOutcome {
    Done(SubTask),
    Retry(SubTask),
}

/// Record the outcome of one attempt, and decide whether to retry (spec §4.5 "retry
/// wiring"): the Evaluator only recommends; this function is where the decision to
/// actually retry is made and where `retry_count` advances.
async fn finalize_attempt(evaluator: &Evaluator, config: &OrchestrationConfig, trace: &TraceContext, mut subtask: SubTask, result: AgentResult) -> AttemptOutcome {
    let is_timeout = result.error.as_deref().is_some_and(|e| e.starts_with("Task timed out"));

    if result.success {
        trace.record_event("task_complete", json!({ "task_id": subtask.id, "execution_time_ms": result.execution_time_ms }));
        subtask.transition(SubTaskStatus::Completed);
        subtask.result = Some(result);
        return AttemptOutcome::Done(subtask);
    }

    trace.record_event(
        if is_timeout { "task_timeout" } else { "task_error" },
        json!({ "task_id": subtask.id, "error": result.error }),
    );

    if config.enable_retry {
        let evaluation = evaluator.evaluate(&subtask.description, &result, &config.evaluation_criteria).await;
        if evaluation.retry_recommended && subtask.retry_count < config.retry_config.max_retries {
            tokio::time::sleep(config.retry_config.delay_for(subtask.retry_count)).await;
            subtask.retry_count += 1;
            return AttemptOutcome::Retry(subtask);
        }
    }

    subtask.transition(SubTaskStatus::Failed);
    subtask.error = result.error.clone();
    subtask.result = Some(result);
    AttemptOutcome::Done(subtask)
}

/// Execute `subtask` to a terminal state, retrying in place per [`finalize_attempt`]
/// before returning to the batch that spawned it.
async fn execute_with_retry(
    agent_executor: Arc<AgentExecutor>,
    evaluator: Arc<Evaluator>,
    mut subtask: SubTask,
    ctx: AgentContext,
    config: OrchestrationConfig,
    timeout_secs: u64,
    trace: TraceContext,
) -> SubTask {
    subtask.transition(SubTaskStatus::Running);
    loop {
        trace.record_event("task_start", json!({ "task_id": subtask.id, "retry_count": subtask.retry_count }));
        let result = execute_single(&agent_executor, &subtask, ctx.clone(), timeout_secs).await;
        match finalize_attempt(&evaluator, &config, &trace, subtask, result).await {
            AttemptOutcome::Done(finished) => return finished,
            AttemptOutcome::Retry(next) => subtask = next,
        }
    }
}

/// One chunk of the Parallel Executor's streaming variant (spec §4.5), tagged by the
/// subtask id it belongs to so a caller can demultiplex an interleaved batch.
#[derive(Debug, Clone)]
pub enum ParallelChunk {
    BatchStart { batch_index: usize, task_ids: Vec<String> },
    AgentStart { task_id: String, description: String, timeout_secs: u64 },
    AgentChunk { task_id: String, chunk: AgentStreamChunk },
    AgentDone { task_id: String, success: bool, execution_time_ms: u64, answer_length: Option<usize>, timeout: bool, error: Option<String> },
    BatchDone { batch_index: usize },
    Error { message: String },
}

/// Stream one subtask to completion, forwarding every inner chunk tagged with its task
/// id, retrying in place exactly like [`execute_with_retry`] on failure.
async fn stream_subtask(
    agent_executor: Arc<AgentExecutor>,
    evaluator: Arc<Evaluator>,
    mut subtask: SubTask,
    ctx: AgentContext,
    config: OrchestrationConfig,
    timeout_secs: u64,
    trace: TraceContext,
    tx: mpsc::UnboundedSender<ParallelChunk>,
) -> SubTask {
    subtask.transition(SubTaskStatus::Running);
    let _ = tx.send(ParallelChunk::AgentStart {
        task_id: subtask.id.clone(),
        description: subtask.description.clone(),
        timeout_secs,
    });

    loop {
        trace.record_event("task_start", json!({ "task_id": subtask.id, "retry_count": subtask.retry_count }));

        let mut inner_rx = Arc::clone(&agent_executor).stream(subtask.agent_kind, subtask.description.clone(), ctx.clone());
        let task_id = subtask.id.clone();
        let forward_tx = tx.clone();
        let start = std::time::Instant::now();
        let drain = async move {
            let mut final_result = None;
            while let Some(chunk) = inner_rx.recv().await {
                if let AgentStreamChunk::Done { result } = &chunk {
                    final_result = Some(result.clone());
                }
                let _ = forward_tx.send(ParallelChunk::AgentChunk { task_id: task_id.clone(), chunk });
            }
            final_result
        };

        let result = match tokio::time::timeout(Duration::from_secs(timeout_secs), drain).await {
            Ok(Some(result)) => result,
            Ok(None) => AgentResult::failed(subtask.agent_kind, "Execution failed: stream closed without a result", start.elapsed().as_millis() as u64),
            Err(_elapsed) => AgentResult::failed(subtask.agent_kind, format!("Task timed out after {timeout_secs}s"), timeout_secs * 1000),
        };

        let is_timeout = result.error.as_deref().is_some_and(|e| e.starts_with("Task timed out"));
        let _ = tx.send(ParallelChunk::AgentDone {
            task_id: subtask.id.clone(),
            success: result.success,
            execution_time_ms: result.execution_time_ms,
            answer_length: result.success.then(|| result.answer.chars().count()),
            timeout: is_timeout,
            error: result.error.clone(),
        });

        match finalize_attempt(&evaluator, &config, &trace, subtask, result).await {
            AttemptOutcome::Done(finished) => return finished,
            AttemptOutcome::Retry(next) => subtask = next,
        }
    }
}

/// Batch-parallel fan-out/fan-in executor: runs a [`TaskDAG`]'s batches in topological
/// order, each batch run concurrently (or sequentially when disabled or trivial), and
/// aggregates the per-subtask [`AgentResult`]s (spec §4.5).
pub struct ParallelExecutor {
    agent_executor: Arc<AgentExecutor>,
    evaluator: Arc<Evaluator>,
}

impl ParallelExecutor {
    pub fn new(agent_executor: Arc<AgentExecutor>, evaluator: Arc<Evaluator>) -> Self {
        Self { agent_executor, evaluator }
    }

    /// Run `dag` to completion, writing each subtask's terminal status/result back into
    /// `dag.tasks` and returning the completed results keyed by subtask id.
    pub async fn execute_dag(
        &self,
        dag: &mut TaskDAG,
        ctx: &AgentContext,
        config: &OrchestrationConfig,
        runtime_config: &RuntimeConfig,
        trace: &TraceContext,
    ) -> HashMap<String, AgentResult> {
        let mut completed: HashMap<String, AgentResult> = HashMap::new();
        let batches = dag.batches.clone();

        for (batch_index, batch_ids) in batches.iter().enumerate() {
            trace.record_event("batch_start", json!({ "batch_index": batch_index, "task_ids": batch_ids }));

            let prepared: Vec<SubTask> = batch_ids.iter().filter_map(|id| dag.tasks.get(id).cloned()).collect();

            let finished: Vec<SubTask> = if config.enable_parallel && prepared.len() > 1 {
                let mut handles = Vec::with_capacity(prepared.len());
                for subtask in prepared {
                    let timeout_secs = resolve_timeout(&subtask, config, runtime_config);
                    let task_ctx = ctx.extended_with(&build_dependency_context(&subtask, &completed));
                    handles.push(tokio::spawn(execute_with_retry(
                        Arc::clone(&self.agent_executor),
                        Arc::clone(&self.evaluator),
                        subtask,
                        task_ctx,
                        config.clone(),
                        timeout_secs,
                        trace.clone(),
                    )));
                }
                let mut out = Vec::with_capacity(handles.len());
                for handle in handles {
                    match handle.await {
                        Ok(subtask) => out.push(subtask),
                        Err(join_err) => warn!("parallel executor: a subtask's supervising task panicked: {join_err}"),
                    }
                }
                out
            } else {
                let mut out = Vec::with_capacity(prepared.len());
                for subtask in prepared {
                    let timeout_secs = resolve_timeout(&subtask, config, runtime_config);
                    let task_ctx = ctx.extended_with(&build_dependency_context(&subtask, &completed));
                    out.push(
                        execute_with_retry(
                            Arc::clone(&self.agent_executor),
                            Arc::clone(&self.evaluator),
                            subtask,
                            task_ctx,
                            config.clone(),
                            timeout_secs,
                            trace.clone(),
                        )
                        .await,
                    );
                }
                out
            };

            let mut batch_failed = false;
            for subtask in finished {
                let id = subtask.id.clone();
                if let Some(result) = subtask.result.clone() {
                    batch_failed |= !result.success;
                    completed.insert(id.clone(), result);
                }
                if let Some(slot) = dag.tasks.get_mut(&id) {
                    *slot = subtask;
                }
            }

            trace.record_event("batch_done", json!({ "batch_index": batch_index, "failed": batch_failed }));

            if batch_failed && !config.continue_on_failure {
                for later_batch in &batches[batch_index + 1..] {
                    for id in later_batch {
                        if let Some(slot) = dag.tasks.get_mut(id) {
                            slot.transition(SubTaskStatus::Skipped);
                        }
                    }
                }
                break;
            }
        }

        completed
    }

    /// Streaming variant of [`Self::execute_dag`]: interleaves every subtask's live
    /// stream through one channel, tagged by task id, in the same batch order (spec
    /// §4.5's streaming mode). `dag` is consumed rather than mutated in place since the
    /// per-subtask status updates have already been fully communicated via chunks by the
    /// time the channel closes.
    pub fn stream_dag(&self, dag: TaskDAG, ctx: AgentContext, config: OrchestrationConfig, runtime_config: RuntimeConfig, trace: TraceContext) -> mpsc::UnboundedReceiver<ParallelChunk> {
        let (tx, rx) = mpsc::unbounded_channel();
        let agent_executor = Arc::clone(&self.agent_executor);
        let evaluator = Arc::clone(&self.evaluator);

        tokio::spawn(async move {
            let batches = dag.batches.clone();
            let mut completed: HashMap<String, AgentResult> = HashMap::new();

            for (batch_index, batch_ids) in batches.iter().enumerate() {
                let _ = tx.send(ParallelChunk::BatchStart { batch_index, task_ids: batch_ids.clone() });
                trace.record_event("batch_start", json!({ "batch_index": batch_index, "task_ids": batch_ids }));

                let prepared: Vec<SubTask> = batch_ids.iter().filter_map(|id| dag.tasks.get(id).cloned()).collect();

                let finished: Vec<SubTask> = if config.enable_parallel && prepared.len() > 1 {
                    let mut handles = Vec::with_capacity(prepared.len());
                    for subtask in prepared {
                        let timeout_secs = resolve_timeout(&subtask, &config, &runtime_config);
                        let task_ctx = ctx.extended_with(&build_dependency_context(&subtask, &completed));
                        handles.push(tokio::spawn(stream_subtask(
                            Arc::clone(&agent_executor),
                            Arc::clone(&evaluator),
                            subtask,
                            task_ctx,
                            config.clone(),
                            timeout_secs,
                            trace.clone(),
                            tx.clone(),
                        )));
                    }
                    let mut out = Vec::with_capacity(handles.len());
                    for handle in handles {
                        match handle.await {
                            Ok(subtask) => out.push(subtask),
                            Err(join_err) => {
                                let _ = tx.send(ParallelChunk::Error { message: format!("Execution failed: {join_err}") });
                            }
                        }
                    }
                    out
                } else {
                    let mut out = Vec::with_capacity(prepared.len());
                    for subtask in prepared {
                        let timeout_secs = resolve_timeout(&subtask, &config, &runtime_config);
                        let task_ctx = ctx.extended_with(&build_dependency_context(&subtask, &completed));
                        out.push(
                            stream_subtask(
                                Arc::clone(&agent_executor),
                                Arc::clone(&evaluator),
                                subtask,
                                task_ctx,
                                config.clone(),
                                timeout_secs,
                                trace.clone(),
                                tx.clone(),
                            )
                            .await,
                        );
                    }
                    out
                };

                let mut batch_failed = false;
                for subtask in &finished {
                    if let Some(result) = &subtask.result {
                        batch_failed |= !result.success;
                        completed.insert(subtask.id.clone(), result.clone());
                    }
                }

                let _ = tx.send(ParallelChunk::BatchDone { batch_index });
                trace.record_event("batch_done", json!({ "batch_index": batch_index, "failed": batch_failed }));

                if batch_failed && !config.continue_on_failure {
                    let _ = tx.send(ParallelChunk::Error { message: "a batch failed and continue_on_failure is disabled".to_string() });
                    break;
                }
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentflow::agent_registry::AgentRegistry;
    use crate::agentflow::client::{ChatLlm, Message, TokenUsage, ToolDefinition};
    use crate::agentflow::permissions::PermissionManager;
    use crate::agentflow::tool_registry::ToolRegistry;
    use crate::agentflow::tools::populate_default_registry;
    use crate::agentflow::types::{AgentKind, EvaluationCriteria, RetryConfig};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedLlm(String);

    #[async_trait]
    impl ChatLlm for FixedLlm {
        async fn generate(&self, _messages: &[Message], _tools: Option<Vec<ToolDefinition>>, _temperature: Option<f32>) -> Result<Message, Box<dyn std::error::Error + Send + Sync>> {
            Ok(Message::user(self.0.clone()))
        }
        fn model_name(&self) -> &str {
            "fixed"
        }
        fn usage_slot(&self) -> Option<&tokio::sync::Mutex<Option<TokenUsage>>> {
            None
        }
    }

    struct FlakyLlm {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatLlm for FlakyLlm {
        async fn generate(&self, _messages: &[Message], _tools: Option<Vec<ToolDefinition>>, _temperature: Option<f32>) -> Result<Message, Box<dyn std::error::Error + Send + Sync>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err("temporarily unavailable, please retry".into())
            } else {
                Ok(Message::user("Python is a high-level programming language favored for readability."))
            }
        }
        fn model_name(&self) -> &str {
            "flaky"
        }
        fn usage_slot(&self) -> Option<&tokio::sync::Mutex<Option<TokenUsage>>> {
            None
        }
    }

    fn build_parallel_executor(llm: Arc<dyn ChatLlm>) -> ParallelExecutor {
        let mut tool_registry = ToolRegistry::new();
        populate_default_registry(&mut tool_registry);
        let tool_registry = Arc::new(tool_registry);
        let agent_registry = Arc::new(AgentRegistry::from_tool_registry(&tool_registry));
        let permissions = Arc::new(PermissionManager::with_defaults());
        let agent_executor = Arc::new(crate::agentflow::agent_executor::AgentExecutor::new(llm, tool_registry, agent_registry, permissions));
        let evaluator = Arc::new(Evaluator::new(None));
        ParallelExecutor::new(agent_executor, evaluator)
    }

    #[test]
    fn dependency_context_truncates_and_joins_multiple_deps() {
        let mut completed = HashMap::new();
        completed.insert(
            "t1".to_string(),
            AgentResult { answer: "a".repeat(3000), agent_kind: AgentKind::Rag, steps: 1, tool_calls: vec![], tool_results: vec![], sources: vec![], execution_time_ms: 1, success: true, error: None },
        );
        completed.insert(
            "t2".to_string(),
            AgentResult { answer: "short answer".to_string(), agent_kind: AgentKind::Rag, steps: 1, tool_calls: vec![], tool_results: vec![], sources: vec![], execution_time_ms: 1, success: true, error: None },
        );
        let subtask = SubTask::new("t3", "synthesize", AgentKind::Rag).with_dependencies(vec!["t1".to_string(), "t2".to_string()]);
        let context = build_dependency_context(&subtask, &completed);
        assert!(context.contains("[Result from previous task t1]"));
        assert!(context.contains("[Result from previous task t2]"));
        assert!(context.contains("\n\n"));
        let t1_block = context.split("\n\n").next().unwrap();
        assert_eq!(t1_block.len(), "[Result from previous task t1]\n".len() + DEPENDENCY_CONTEXT_CHARS);
    }

    #[test]
    fn dependency_context_skips_failed_and_empty_dependencies() {
        let mut completed = HashMap::new();
        completed.insert(
            "t1".to_string(),
            AgentResult { answer: "doesn't matter".to_string(), agent_kind: AgentKind::Rag, steps: 1, tool_calls: vec![], tool_results: vec![], sources: vec![], execution_time_ms: 1, success: false, error: Some("oops".to_string()) },
        );
        let subtask = SubTask::new("t2", "next", AgentKind::Rag).with_dependencies(vec!["t1".to_string()]);
        assert!(build_dependency_context(&subtask, &completed).is_empty());
    }

    #[test]
    fn timeout_resolution_honors_the_documented_priority() {
        let mut subtask = SubTask::new("t1", "x", AgentKind::Rag);
        let config = OrchestrationConfig::default().with_timeout_override(AgentKind::Rag, 45);
        let runtime_config = RuntimeConfig::default().with_timeout_override(AgentKind::Rag, 999);

        assert_eq!(resolve_timeout(&subtask, &config, &runtime_config), 45);
        subtask.timeout_override = Some(7);
        assert_eq!(resolve_timeout(&subtask, &config, &runtime_config), 7);

        let bare_config = OrchestrationConfig::default();
        assert_eq!(resolve_timeout(&SubTask::new("t2", "x", AgentKind::Vision), &bare_config, &runtime_config), 90);
    }

    #[tokio::test]
    async fn independent_batch_tasks_execute_and_populate_completed_results() {
        let executor = build_parallel_executor(Arc::new(FixedLlm("Python is great.".to_string())));
        let mut tasks = HashMap::new();
        tasks.insert("t1".to_string(), SubTask::new("t1", "What is Python?", AgentKind::Rag));
        tasks.insert("t2".to_string(), SubTask::new("t2", "What is Go?", AgentKind::Rag));
        let mut dag = TaskDAG { root_task: "compare".to_string(), tasks, batches: vec![vec!["t1".to_string(), "t2".to_string()]], parallelism: crate::agentflow::types::ParallelismKind::Full };

        let ctx = AgentContext::new("sess-1", 10, 300);
        let config = OrchestrationConfig::default();
        let runtime_config = RuntimeConfig::default();
        let trace = TraceContext::new();

        let completed = executor.execute_dag(&mut dag, &ctx, &config, &runtime_config, &trace).await;
        assert_eq!(completed.len(), 2);
        assert_eq!(dag.tasks["t1"].status, SubTaskStatus::Completed);
        assert_eq!(dag.tasks["t2"].status, SubTaskStatus::Completed);
    }

    #[tokio::test]
    async fn a_retryable_failure_is_retried_and_then_succeeds() {
        let executor = build_parallel_executor(Arc::new(FlakyLlm { calls: AtomicUsize::new(0) }));
        let mut tasks = HashMap::new();
        tasks.insert("t1".to_string(), SubTask::new("t1", "What is Python?", AgentKind::Rag));
        let mut dag = TaskDAG::single_task("What is Python?", "t1", AgentKind::Rag);
        dag.tasks = tasks;

        let ctx = AgentContext::new("sess-1", 10, 300);
        let config = OrchestrationConfig { evaluation_criteria: EvaluationCriteria::default(), retry_config: RetryConfig { initial_delay_ms: 1, ..RetryConfig::default() }, ..OrchestrationConfig::default() };
        let runtime_config = RuntimeConfig::default();
        let trace = TraceContext::new();

        let completed = executor.execute_dag(&mut dag, &ctx, &config, &runtime_config, &trace).await;
        assert!(completed["t1"].success);
        assert_eq!(dag.tasks["t1"].retry_count, 1);
    }

    #[tokio::test]
    async fn continue_on_failure_false_skips_later_batches() {
        struct AlwaysFailLlm;
        #[async_trait]
        impl ChatLlm for AlwaysFailLlm {
            async fn generate(&self, _messages: &[Message], _tools: Option<Vec<ToolDefinition>>, _temperature: Option<f32>) -> Result<Message, Box<dyn std::error::Error + Send + Sync>> {
                Err("permanent failure".into())
            }
            fn model_name(&self) -> &str {
                "always-fail"
            }
            fn usage_slot(&self) -> Option<&tokio::sync::Mutex<Option<TokenUsage>>> {
                None
            }
        }

        let executor = build_parallel_executor(Arc::new(AlwaysFailLlm));
        let mut tasks = HashMap::new();
        tasks.insert("t1".to_string(), SubTask::new("t1", "first", AgentKind::Rag));
        tasks.insert("t2".to_string(), SubTask::new("t2", "second", AgentKind::Rag).with_dependencies(vec!["t1".to_string()]));
        let mut dag = TaskDAG { root_task: "pipeline".to_string(), tasks, batches: vec![vec!["t1".to_string()], vec!["t2".to_string()]], parallelism: crate::agentflow::types::ParallelismKind::Pipeline };

        let ctx = AgentContext::new("sess-1", 10, 300);
        let config = OrchestrationConfig { enable_retry: false, continue_on_failure: false, ..OrchestrationConfig::default() };
        let runtime_config = RuntimeConfig::default();
        let trace = TraceContext::new();

        executor.execute_dag(&mut dag, &ctx, &config, &runtime_config, &trace).await;
        assert_eq!(dag.tasks["t1"].status, SubTaskStatus::Failed);
        assert_eq!(dag.tasks["t2"].status, SubTaskStatus::Skipped);
    }

    #[tokio::test]
    async fn one_subtask_times_out_while_its_batch_sibling_still_completes() {
        // One shared LLM backs the whole executor, so the mock has to tell the two
        // subtasks apart by the task text riding along in the last message: the "Go"
        // prompt stalls past its timeout, the "Python" prompt answers immediately.
        struct PartlySlowLlm;
        #[async_trait]
        impl ChatLlm for PartlySlowLlm {
            async fn generate(&self, messages: &[Message], _tools: Option<Vec<ToolDefinition>>, _temperature: Option<f32>) -> Result<Message, Box<dyn std::error::Error + Send + Sync>> {
                let mentions_go = messages.iter().any(|m| m.content.contains("Go"));
                if mentions_go {
                    tokio::time::sleep(Duration::from_secs(200)).await;
                    return Ok(Message::user("never reached"));
                }
                Ok(Message::user("Python is a dynamically typed language."))
            }
            fn model_name(&self) -> &str {
                "partly-slow"
            }
            fn usage_slot(&self) -> Option<&tokio::sync::Mutex<Option<TokenUsage>>> {
                None
            }
        }

        let executor = build_parallel_executor(Arc::new(PartlySlowLlm));
        let mut tasks = HashMap::new();
        let mut t1 = SubTask::new("t1", "What is Python?", AgentKind::Rag);
        t1.timeout_override = Some(1);
        let mut t2 = SubTask::new("t2", "What is Go?", AgentKind::Rag);
        t2.timeout_override = Some(1);
        tasks.insert("t1".to_string(), t1);
        tasks.insert("t2".to_string(), t2);
        let mut dag = TaskDAG { root_task: "compare".to_string(), tasks, batches: vec![vec!["t1".to_string(), "t2".to_string()]], parallelism: crate::agentflow::types::ParallelismKind::Full };

        let ctx = AgentContext::new("sess-1", 10, 300);
        let config = OrchestrationConfig { enable_retry: false, ..OrchestrationConfig::default() };
        let runtime_config = RuntimeConfig::default();
        let trace = TraceContext::new();

        let completed = executor.execute_dag(&mut dag, &ctx, &config, &runtime_config, &trace).await;
        assert!(completed["t1"].success);
        assert_eq!(dag.tasks["t1"].status, SubTaskStatus::Completed);
        assert!(!completed["t2"].success);
        assert_eq!(completed["t2"].error.as_deref(), Some("Task timed out after 1s"));
        assert_eq!(dag.tasks["t2"].status, SubTaskStatus::Failed);
    }

    #[tokio::test]
    async fn stream_dag_emits_batch_and_agent_chunks() {
        let executor = build_parallel_executor(Arc::new(FixedLlm("Python is great.".to_string())));
        let dag = TaskDAG::single_task("What is Python?", "t1", AgentKind::Rag);
        let ctx = AgentContext::new("sess-1", 10, 300);
        let config = OrchestrationConfig::default();
        let runtime_config = RuntimeConfig::default();
        let trace = TraceContext::new();

        let mut rx = executor.stream_dag(dag, ctx, config, runtime_config, trace);
        let mut saw_batch_start = false;
        let mut saw_agent_done = false;
        while let Some(chunk) = rx.recv().await {
            match chunk {
                ParallelChunk::BatchStart { .. } => saw_batch_start = true,
                ParallelChunk::AgentDone { success, .. } => saw_agent_done = success,
                _ => {}
            }
        }
        assert!(saw_batch_start);
        assert!(saw_agent_done);
    }
}
