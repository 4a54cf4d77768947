//! The Orchestrator (spec §4.8): the single entry point that turns one user task into a
//! final answer by classifying it, deciding whether it needs decomposition, running the
//! resulting subtasks, and synthesizing their results.
//!
//! Grounded on `orchestration.rs`'s mode-dispatch `run()` entry point (classify → pick a
//! mode → execute → format); `original_source/app/api/agents/orchestrator.py` for the
//! full classify → decompose → execute → evaluate → synthesize sequence, the
//! URL-context fetch, and the localized all-tasks-failed fallback strings.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use log::warn;
use regex::Regex;
use serde_json::json;
use sha2::{Digest, Sha256};

use super::agent_executor::{AgentExecutor, AgentStreamChunk};
use super::agent_registry::AgentRegistry;
use super::client::{ChatLlm, Message};
use super::config::RuntimeConfig;
use super::dag::DagBuilder;
use super::evaluator::Evaluator;
use super::intent::IntentClassifier;
use super::parallel_executor::{ParallelChunk, ParallelExecutor};
use super::permissions::PermissionManager;
use super::tool_registry::ToolRegistry;
use super::tools::populate_default_registry;
use super::trace::{SpanKind, TraceContext};
use super::types::{
    AgentContext, AgentKind, AgentResult, OrchestrationConfig, QueryLogRecord, Source, TaskDAG, MAX_SOURCES,
};
use super::writers::{QueryLogWriter, Repository, TraceWriter};

/// Characters of fetched URL content kept before truncation (spec §4.8, distinct from
/// [`super::tools::web_fetch::WebFetchTool`]'s own fetch-size cap).
const URL_CONTEXT_MAX_CHARS: usize = 10_000;
const URL_CONTEXT_TRUNCATION_MARKER: &str = "\n\n[... content truncated ...]";
const MAX_NEXT_ACTIONS: usize = 3;

lazy_static! {
    /// Multilingual (English/Korean/Japanese) keyword tables used to pick an agent kind
    /// when a caller supplies no explicit hint (spec §4.8 step 2). Every kind, including
    /// `Rag`, is a genuine scoring competitor; ties are broken in RAG's favor.
    static ref AGENT_KEYWORDS: HashMap<AgentKind, Vec<Regex>> = {
        let mut map = HashMap::new();
        map.insert(
            AgentKind::Rag,
            compile_patterns(&[
                r"(?i)\bwhat\b", r"(?i)\bhow\b", r"(?i)\bexplain\b", r"(?i)\bwhy\b",
                "설명", "어떻게", "왜", "무엇",
                "説明", "どう", "なぜ", "何",
            ]),
        );
        map.insert(
            AgentKind::Ims,
            compile_patterns(&[
                r"(?i)\bticket\b", r"(?i)\bissue\b", r"(?i)bug report", r"(?i)\bjira\b",
                "이슈", "티켓", "버그", "장애",
                "チケット", "課題", "バグ", "障害",
            ]),
        );
        map.insert(
            AgentKind::Vision,
            compile_patterns(&[
                r"(?i)\bimage\b", r"(?i)screenshot", r"(?i)\bphoto\b", r"(?i)\bdiagram\b",
                "이미지", "스크린샷", "사진", "다이어그램",
                "画像", "スクリーンショット", "写真", "図",
            ]),
        );
        map.insert(
            AgentKind::Code,
            compile_patterns(&[
                r"(?i)\bcode\b", r"(?i)\bfunction\b", r"(?i)\bcompile\b", r"(?i)stack trace",
                "코드", "함수", "컴파일", "스택 트레이스",
                "コード", "関数", "コンパイル", "スタックトレース",
            ]),
        );
        map.insert(
            AgentKind::Planner,
            compile_patterns(&[
                r"(?i)\bplan\b", r"(?i)\broadmap\b", r"(?i)\bstrategy\b", r"(?i)milestones?",
                "계획", "전략", "로드맵", "일정",
                "計画", "戦略", "ロードマップ", "工程",
            ]),
        );
        map
    };
}

fn compile_patterns(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

/// Pick an [`AgentKind`] for a task: an explicit hint always wins; otherwise every kind
/// is scored by keyword hits and the highest-scoring kind wins; if `Rag` is among the
/// top scorers (including a tie), it wins; zero hits everywhere also falls back to
/// [`AgentKind::Rag`].
fn classify_agent_kind(text: &str, hint: Option<AgentKind>) -> AgentKind {
    if let Some(kind) = hint {
        return kind;
    }
    let mut scores: HashMap<AgentKind, usize> = HashMap::new();
    for kind in AgentKind::ALL {
        let Some(patterns) = AGENT_KEYWORDS.get(&kind) else { continue };
        let hits = patterns.iter().filter(|re| re.is_match(text)).count();
        if hits > 0 {
            scores.insert(kind, hits);
        }
    }
    let Some(&top_score) = scores.values().max() else {
        return AgentKind::Rag;
    };
    if scores.get(&AgentKind::Rag) == Some(&top_score) {
        return AgentKind::Rag;
    }
    AgentKind::ALL
        .into_iter()
        .find(|kind| scores.get(kind) == Some(&top_score))
        .unwrap_or(AgentKind::Rag)
}

fn truncate_with_marker(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}{URL_CONTEXT_TRUNCATION_MARKER}")
}

/// A minimal, dependency-free HTML-to-text pass: drop tags, collapse whitespace. Kept
/// separate from [`super::tools::web_fetch::WebFetchTool`]'s own stripping since the two
/// call sites use a different truncation marker and don't otherwise need to share code.
fn strip_html(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut in_tag = false;
    for c in body.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

async fn fetch_url_context(client: &reqwest::Client, url: &str) -> Option<String> {
    let response = match client.get(url).send().await {
        Ok(r) => r,
        Err(e) => {
            warn!("orchestrator: url context fetch failed for {url}: {e}");
            return None;
        }
    };
    let body = match response.text().await {
        Ok(b) => b,
        Err(e) => {
            warn!("orchestrator: url context body read failed for {url}: {e}");
            return None;
        }
    };
    Some(truncate_with_marker(&strip_html(&body), URL_CONTEXT_MAX_CHARS))
}

fn localized_all_failed_message(language: &str) -> &'static str {
    match language {
        "ko" => "모든 작업이 실패했습니다. 나중에 다시 시도해주세요.",
        "ja" => "すべてのタスクが失敗しました。後でもう一度お試しください。",
        _ => "All tasks failed. Please try again later.",
    }
}

/// Spec §8 boundary behavior: empty task text never reaches the DAG builder or agent
/// executor; the orchestrator answers directly in the requested language.
fn localized_please_rephrase_message(language: &str) -> &'static str {
    match language {
        "ko" => "요청을 이해하지 못했습니다. 다시 말씀해주시겠어요?",
        "ja" => "リクエストを理解できませんでした。言い換えていただけますか?",
        _ => "I didn't receive a question. Could you please rephrase your request?",
    }
}

fn concatenation_fallback(completed: &HashMap<String, AgentResult>) -> String {
    let mut entries: Vec<(&String, &AgentResult)> = completed.iter().filter(|(_, r)| r.success).collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries.iter().map(|(id, r)| format!("[{id}]\n{}", r.answer)).collect::<Vec<_>>().join("\n\n---\n\n")
}

async fn llm_merge(llm: &Arc<dyn ChatLlm>, task_text: &str, completed: &HashMap<String, AgentResult>, language: &str) -> String {
    let fallback = concatenation_fallback(completed);
    let prompt = format!(
        "Combine the following sub-task results into one coherent answer, written in {language}. \
         Resolve overlaps and contradictions instead of just listing every result.\n\n\
         Original task: {task_text}\n\n{fallback}"
    );
    let messages = [Message::user(prompt)];
    match llm.generate(&messages, None, Some(0.3)).await {
        Ok(response) => response.content.to_string(),
        Err(e) => {
            warn!("orchestrator: synthesis LLM merge failed, falling back to concatenation: {e}");
            fallback
        }
    }
}

/// Merge every subtask result of `dag` into one final answer (spec §4.8 step 6):
/// an `is_synthesis`-tagged subtask's own answer wins verbatim when present and
/// successful; otherwise a single success is used verbatim, more than one success is
/// LLM-merged (falling back to concatenation), and zero successes produce a localized
/// failure message.
async fn synthesize(
    llm: &Arc<dyn ChatLlm>,
    evaluator: &Evaluator,
    task_text: &str,
    dag: &TaskDAG,
    completed: &HashMap<String, AgentResult>,
    language: &str,
) -> String {
    for (id, subtask) in &dag.tasks {
        if !subtask.is_synthesis() {
            continue;
        }
        if let Some(result) = completed.get(id) {
            if result.success {
                return result.answer.clone();
            }
        }
    }

    let successes: Vec<&AgentResult> = completed.values().filter(|r| r.success).collect();
    let synthesis = match successes.len() {
        0 => localized_all_failed_message(language).to_string(),
        1 => successes[0].answer.clone(),
        _ => llm_merge(llm, task_text, completed, language).await,
    };
    // Scored purely for tracing (spec §4.8 step 6); its verdict never blocks the response.
    let _ = evaluator.evaluate_synthesis(&synthesis, completed);
    synthesis
}

async fn generate_next_actions(llm: &Arc<dyn ChatLlm>, task_text: &str, synthesis: &str) -> Vec<String> {
    let prompt = format!(
        "Based on the task and the answer below, suggest up to {MAX_NEXT_ACTIONS} concrete follow-up actions \
         the user might take next. Reply with one suggestion per line, each starting with \"- \", and nothing else.\n\n\
         Task: {task_text}\nAnswer: {synthesis}"
    );
    let messages = [Message::user(prompt)];
    let Ok(response) = llm.generate(&messages, None, Some(0.5)).await else {
        return Vec::new();
    };
    response
        .content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            line.strip_prefix("- ").or_else(|| line.strip_prefix("\u{2022} "))
        })
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .take(MAX_NEXT_ACTIONS)
        .collect()
}

fn aggregate_agent_kinds(dag: &TaskDAG) -> Vec<AgentKind> {
    let used: HashSet<AgentKind> = dag.tasks.values().map(|t| t.agent_kind).collect();
    AgentKind::ALL.into_iter().filter(|k| used.contains(k)).collect()
}

fn dedupe_sources(results: impl Iterator<Item = Source>) -> Vec<Source> {
    let mut seen = HashSet::new();
    let mut sources = Vec::new();
    for source in results {
        if seen.insert(source.source.clone()) {
            sources.push(source);
        }
        if sources.len() >= MAX_SOURCES {
            break;
        }
    }
    sources
}

fn normalize_query(task: &str) -> String {
    task.trim().to_lowercase()
}

fn query_hash(normalized_query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_query.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// One incoming task to orchestrate (spec §4.8 step 1's request shape).
#[derive(Debug, Clone)]
pub struct OrchestrationRequest {
    pub task: String,
    pub session_id: String,
    pub user_id: Option<String>,
    pub agent_kind_hint: Option<AgentKind>,
    pub url: Option<String>,
    pub language: String,
    pub history: Vec<(String, String)>,
    pub config: OrchestrationConfig,
    pub max_steps: usize,
    pub timeout_secs: i64,
}

impl OrchestrationRequest {
    pub fn new(task: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            session_id: session_id.into(),
            user_id: None,
            agent_kind_hint: None,
            url: None,
            language: "en".to_string(),
            history: Vec::new(),
            config: OrchestrationConfig::default(),
            max_steps: super::config::DEFAULT_MAX_STEPS,
            timeout_secs: super::config::DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_agent_kind_hint(mut self, kind: AgentKind) -> Self {
        self.agent_kind_hint = Some(kind);
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_history(mut self, history: Vec<(String, String)>) -> Self {
        self.history = history;
        self
    }

    pub fn with_config(mut self, config: OrchestrationConfig) -> Self {
        self.config = config;
        self
    }
}

/// The final, synthesized result of one [`OrchestrationRequest`] (spec §4.8 step 7).
#[derive(Debug, Clone)]
pub struct OrchestrationResponse {
    pub answer: String,
    pub agent_kinds_used: Vec<AgentKind>,
    pub sources: Vec<Source>,
    pub steps: usize,
    pub success: bool,
    pub next_actions: Vec<String>,
    pub trace: super::trace::ExecutionTrace,
}

/// One chunk of a streamed [`OrchestrationResponse`] (spec §4.8's streaming variant).
#[derive(Debug, Clone)]
pub enum OrchestrationChunk {
    Start,
    DagCreated { task_count: usize, batch_count: usize },
    Executor(ParallelChunk),
    Synthesis { text: String, is_final: bool },
    NextActions { actions: Vec<String> },
    Done { response: OrchestrationResponse },
    Error { message: String },
}

/// Builds an [`Orchestrator`] from its required LLM collaborator and optional overrides
/// for the tool registry, permission table, runtime config, and background writers.
pub struct OrchestratorBuilder {
    llm: Option<Arc<dyn ChatLlm>>,
    tool_registry: Option<ToolRegistry>,
    permissions: Option<PermissionManager>,
    runtime_config: RuntimeConfig,
    trace_writer: Option<Arc<TraceWriter<DynTraceRepository>>>,
    query_log_writer: Option<Arc<QueryLogWriter<DynQueryLogRepository>>>,
}

/// Type aliases naming the trait-object repository flavor the builder accepts, so
/// callers don't need to name a concrete repository type to wire a writer in.
pub type DynTraceRepository = dyn Repository<Item = super::trace::ExecutionTrace> + Send + Sync;
pub type DynQueryLogRepository = dyn Repository<Item = QueryLogRecord> + Send + Sync;

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self {
            llm: None,
            tool_registry: None,
            permissions: None,
            runtime_config: RuntimeConfig::default(),
            trace_writer: None,
            query_log_writer: None,
        }
    }
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_llm(mut self, llm: Arc<dyn ChatLlm>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_tool_registry(mut self, registry: ToolRegistry) -> Self {
        self.tool_registry = Some(registry);
        self
    }

    pub fn with_permissions(mut self, permissions: PermissionManager) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn with_runtime_config(mut self, runtime_config: RuntimeConfig) -> Self {
        self.runtime_config = runtime_config;
        self
    }

    pub fn with_trace_writer(mut self, writer: Arc<TraceWriter<DynTraceRepository>>) -> Self {
        self.trace_writer = Some(writer);
        self
    }

    pub fn with_query_log_writer(mut self, writer: Arc<QueryLogWriter<DynQueryLogRepository>>) -> Self {
        self.query_log_writer = Some(writer);
        self
    }

    pub fn build(self) -> Orchestrator {
        let llm = self.llm.expect("OrchestratorBuilder requires an LLM collaborator via with_llm");

        let tool_registry = Arc::new(self.tool_registry.unwrap_or_else(|| {
            let mut registry = ToolRegistry::new();
            populate_default_registry(&mut registry);
            registry
        }));
        let agent_registry = Arc::new(AgentRegistry::from_tool_registry(&tool_registry));
        let permissions = Arc::new(self.permissions.unwrap_or_default());

        let llm_tier: Option<Arc<dyn ChatLlm>> = self.runtime_config.llm_tiers_enabled.then(|| Arc::clone(&llm));

        let agent_executor = Arc::new(AgentExecutor::new(Arc::clone(&llm), tool_registry, agent_registry, permissions));
        let evaluator = Arc::new(Evaluator::new(llm_tier.clone()));
        let dag_builder = Arc::new(DagBuilder::new(llm_tier.clone()));
        let intent_classifier = Arc::new(IntentClassifier::new(llm_tier));
        let parallel_executor = Arc::new(ParallelExecutor::new(Arc::clone(&agent_executor), Arc::clone(&evaluator)));

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Orchestrator {
            llm,
            agent_executor,
            parallel_executor,
            dag_builder,
            intent_classifier,
            evaluator,
            runtime_config: self.runtime_config,
            http_client,
            trace_writer: self.trace_writer,
            query_log_writer: self.query_log_writer,
        }
    }
}

/// End-to-end coordinator: classify, decompose, execute, evaluate, synthesize.
pub struct Orchestrator {
    llm: Arc<dyn ChatLlm>,
    agent_executor: Arc<AgentExecutor>,
    parallel_executor: Arc<ParallelExecutor>,
    dag_builder: Arc<DagBuilder>,
    intent_classifier: Arc<IntentClassifier>,
    evaluator: Arc<Evaluator>,
    runtime_config: RuntimeConfig,
    http_client: reqwest::Client,
    trace_writer: Option<Arc<TraceWriter<DynTraceRepository>>>,
    query_log_writer: Option<Arc<QueryLogWriter<DynQueryLogRepository>>>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    fn submit_trace(&self, trace: super::trace::ExecutionTrace) {
        if let Some(writer) = &self.trace_writer {
            writer.submit_nowait(trace);
        }
    }

    fn submit_query_log(&self, request: &OrchestrationRequest, agent_kinds: &[AgentKind], success: bool, latency_ms: u64) {
        let Some(writer) = &self.query_log_writer else { return };
        let normalized_query = normalize_query(&request.task);
        let record = QueryLogRecord {
            query_hash: query_hash(&normalized_query),
            normalized_query,
            session_id: request.session_id.clone(),
            user_id: request.user_id.clone(),
            agent_kinds: agent_kinds.to_vec(),
            success,
            latency_ms,
            timestamp: chrono::Utc::now(),
        };
        writer.submit_nowait(record);
    }

    async fn build_context(&self, request: &OrchestrationRequest, trace: &TraceContext, parent_span: &str) -> AgentContext {
        let mut ctx = AgentContext::new(request.session_id.clone(), request.max_steps, request.timeout_secs);
        ctx.user_id = request.user_id.clone();
        ctx.language = request.language.clone();
        ctx.history = request.history.clone();

        if let Some(url) = &request.url {
            let span = trace.span(Some(parent_span), "url_context_fetch", SpanKind::ToolCall);
            match fetch_url_context(&self.http_client, url).await {
                Some(content) => {
                    ctx.file_context = if ctx.file_context.is_empty() {
                        content.clone()
                    } else {
                        format!("{content}\n\n{}", ctx.file_context)
                    };
                    ctx.url_context = Some(content);
                    span.end(super::trace::SpanStatus::Ok, None);
                }
                None => span.end(super::trace::SpanStatus::Error, Some(format!("failed to fetch {url}"))),
            }
        }
        ctx
    }

    /// Run one task to completion and return its synthesized response (spec §4.8).
    pub async fn execute(&self, request: OrchestrationRequest) -> OrchestrationResponse {
        let start = Instant::now();
        let trace = TraceContext::new();
        let root_span = trace.span(None, "orchestration", SpanKind::Orchestration);
        trace.record_event("orchestration_start", json!({ "session_id": request.session_id, "task": request.task }));

        let root_span_id = root_span.span_id().to_string();

        if request.task.trim().is_empty() {
            let answer = localized_please_rephrase_message(&request.language).to_string();
            let latency_ms = start.elapsed().as_millis() as u64;
            self.submit_query_log(&request, &[], false, latency_ms);
            root_span.end(super::trace::SpanStatus::Error, Some("empty task text".to_string()));
            let trace_snapshot = trace.finish(None);
            self.submit_trace(trace_snapshot.clone());
            return OrchestrationResponse {
                answer,
                agent_kinds_used: Vec::new(),
                sources: Vec::new(),
                steps: 0,
                success: false,
                next_actions: Vec::new(),
                trace: trace_snapshot,
            };
        }

        let mut ctx = self.build_context(&request, &trace, &root_span_id).await;

        let agent_kind = classify_agent_kind(&request.task, request.agent_kind_hint);
        let intent = {
            let _span = trace.span(Some(&root_span_id), "intent_classification", SpanKind::IntentClassification);
            self.intent_classifier.classify(&request.task, Some(agent_kind)).await
        };
        ctx.intent = Some(intent);

        if !request.config.enable_multi_agent {
            let result = self.agent_executor.run(agent_kind, &request.task, &ctx).await;
            let latency_ms = start.elapsed().as_millis() as u64;
            self.submit_query_log(&request, &[agent_kind], result.success, latency_ms);
            root_span.end(
                if result.success { super::trace::SpanStatus::Ok } else { super::trace::SpanStatus::Error },
                result.error.clone(),
            );
            let trace_snapshot = trace.finish(None);
            self.submit_trace(trace_snapshot.clone());
            return OrchestrationResponse {
                answer: result.answer,
                agent_kinds_used: vec![agent_kind],
                sources: result.sources,
                steps: result.steps,
                success: result.success,
                next_actions: Vec::new(),
                trace: trace_snapshot,
            };
        }

        let mut dag = {
            let _span = trace.span(Some(&root_span_id), "dag_build", SpanKind::DagBuild);
            self.dag_builder.build(&request.task, Some(agent_kind)).await
        };
        trace.record_event("dag_created", json!({ "task_count": dag.tasks.len(), "batches": dag.batches.len() }));

        let completed = self
            .parallel_executor
            .execute_dag(&mut dag, &ctx, &request.config, &self.runtime_config, &trace)
            .await;

        let synthesis = {
            let _span = trace.span(Some(&root_span_id), "synthesis", SpanKind::Synthesis);
            synthesize(&self.llm, &self.evaluator, &request.task, &dag, &completed, &request.language).await
        };

        let next_actions = if request.config.enable_next_actions {
            generate_next_actions(&self.llm, &request.task, &synthesis).await
        } else {
            Vec::new()
        };

        let agent_kinds_used = aggregate_agent_kinds(&dag);
        let sources = dedupe_sources(completed.values().flat_map(|r| r.sources.clone()));
        let steps: usize = completed.values().map(|r| r.steps).sum();
        let success = completed.values().any(|r| r.success);

        let latency_ms = start.elapsed().as_millis() as u64;
        self.submit_query_log(&request, &agent_kinds_used, success, latency_ms);

        root_span.end(if success { super::trace::SpanStatus::Ok } else { super::trace::SpanStatus::Error }, None);
        let trace_snapshot = trace.finish(Some(dag));
        self.submit_trace(trace_snapshot.clone());

        OrchestrationResponse {
            answer: synthesis,
            agent_kinds_used,
            sources,
            steps,
            success,
            next_actions,
            trace: trace_snapshot,
        }
    }

    /// Streaming variant of [`Self::execute`]: forwards every subtask's stream chunks
    /// (or, for a single-agent run, the agent's own stream) as they arrive, then a final
    /// synthesis, next-action list, and `Done` carrying the same response `execute`
    /// would have returned.
    pub fn stream(&self, request: OrchestrationRequest) -> tokio::sync::mpsc::UnboundedReceiver<OrchestrationChunk> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        let llm = Arc::clone(&self.llm);
        let agent_executor = Arc::clone(&self.agent_executor);
        let parallel_executor = Arc::clone(&self.parallel_executor);
        let dag_builder = Arc::clone(&self.dag_builder);
        let intent_classifier = Arc::clone(&self.intent_classifier);
        let evaluator = Arc::clone(&self.evaluator);
        let runtime_config = self.runtime_config.clone();
        let http_client = self.http_client.clone();
        let trace_writer = self.trace_writer.clone();
        let query_log_writer = self.query_log_writer.clone();

        tokio::spawn(async move {
            let start = Instant::now();
            let _ = tx.send(OrchestrationChunk::Start);

            let trace = TraceContext::new();
            let root_span = trace.span(None, "orchestration", SpanKind::Orchestration);
            let root_span_id = root_span.span_id().to_string();
            trace.record_event("orchestration_start", json!({ "session_id": request.session_id, "task": request.task }));

            if request.task.trim().is_empty() {
                let answer = localized_please_rephrase_message(&request.language).to_string();
                let latency_ms = start.elapsed().as_millis() as u64;
                if let Some(writer) = &query_log_writer {
                    let normalized_query = normalize_query(&request.task);
                    writer.submit_nowait(QueryLogRecord {
                        query_hash: query_hash(&normalized_query),
                        normalized_query,
                        session_id: request.session_id.clone(),
                        user_id: request.user_id.clone(),
                        agent_kinds: Vec::new(),
                        success: false,
                        latency_ms,
                        timestamp: chrono::Utc::now(),
                    });
                }
                root_span.end(super::trace::SpanStatus::Error, Some("empty task text".to_string()));
                let trace_snapshot = trace.finish(None);
                if let Some(writer) = &trace_writer {
                    writer.submit_nowait(trace_snapshot.clone());
                }
                let response = OrchestrationResponse {
                    answer,
                    agent_kinds_used: Vec::new(),
                    sources: Vec::new(),
                    steps: 0,
                    success: false,
                    next_actions: Vec::new(),
                    trace: trace_snapshot,
                };
                let _ = tx.send(OrchestrationChunk::Done { response });
                return;
            }

            let mut ctx = AgentContext::new(request.session_id.clone(), request.max_steps, request.timeout_secs);
            ctx.user_id = request.user_id.clone();
            ctx.language = request.language.clone();
            ctx.history = request.history.clone();

            if let Some(url) = &request.url {
                let span = trace.span(Some(&root_span_id), "url_context_fetch", SpanKind::ToolCall);
                if let Some(content) = fetch_url_context(&http_client, url).await {
                    ctx.file_context = if ctx.file_context.is_empty() {
                        content.clone()
                    } else {
                        format!("{content}\n\n{}", ctx.file_context)
                    };
                    ctx.url_context = Some(content);
                    span.end(super::trace::SpanStatus::Ok, None);
                } else {
                    span.end(super::trace::SpanStatus::Error, Some(format!("failed to fetch {url}")));
                }
            }

            let agent_kind = classify_agent_kind(&request.task, request.agent_kind_hint);
            let intent = intent_classifier.classify(&request.task, Some(agent_kind)).await;
            ctx.intent = Some(intent);

            if !request.config.enable_multi_agent {
                let mut inner_rx = Arc::clone(&agent_executor).stream(agent_kind, request.task.clone(), ctx.clone());
                let mut final_result: Option<AgentResult> = None;
                while let Some(chunk) = inner_rx.recv().await {
                    if let AgentStreamChunk::Done { result } = &chunk {
                        final_result = Some(result.clone());
                    }
                    let _ = tx.send(OrchestrationChunk::Executor(ParallelChunk::AgentChunk { task_id: "main".to_string(), chunk }));
                }
                let success = final_result.as_ref().map(|r| r.success).unwrap_or(false);
                let latency_ms = start.elapsed().as_millis() as u64;
                if let Some(writer) = &query_log_writer {
                    let normalized_query = normalize_query(&request.task);
                    writer.submit_nowait(QueryLogRecord {
                        query_hash: query_hash(&normalized_query),
                        normalized_query,
                        session_id: request.session_id.clone(),
                        user_id: request.user_id.clone(),
                        agent_kinds: vec![agent_kind],
                        success,
                        latency_ms,
                        timestamp: chrono::Utc::now(),
                    });
                }
                let trace_snapshot = trace.finish(None);
                if let Some(writer) = &trace_writer {
                    writer.submit_nowait(trace_snapshot.clone());
                }
                let response = OrchestrationResponse {
                    answer: final_result.as_ref().map(|r| r.answer.clone()).unwrap_or_default(),
                    agent_kinds_used: vec![agent_kind],
                    sources: final_result.map(|r| r.sources).unwrap_or_default(),
                    steps: 0,
                    success,
                    next_actions: Vec::new(),
                    trace: trace_snapshot,
                };
                let _ = tx.send(OrchestrationChunk::Done { response });
                return;
            }

            let mut dag = dag_builder.build(&request.task, Some(agent_kind)).await;
            let _ = tx.send(OrchestrationChunk::DagCreated { task_count: dag.tasks.len(), batch_count: dag.batches.len() });
            trace.record_event("dag_created", json!({ "task_count": dag.tasks.len() }));

            let mut exec_rx =
                parallel_executor.stream_dag(dag.clone(), ctx.clone(), request.config.clone(), runtime_config, trace.clone());
            let mut completed: HashMap<String, AgentResult> = HashMap::new();
            while let Some(chunk) = exec_rx.recv().await {
                if let ParallelChunk::AgentChunk { task_id, chunk: AgentStreamChunk::Done { result } } = &chunk {
                    completed.insert(task_id.clone(), result.clone());
                }
                let _ = tx.send(OrchestrationChunk::Executor(chunk));
            }

            let _ = tx.send(OrchestrationChunk::Synthesis { text: String::new(), is_final: false });
            let synthesis = synthesize(&llm, &evaluator, &request.task, &dag, &completed, &request.language).await;
            let _ = tx.send(OrchestrationChunk::Synthesis { text: synthesis.clone(), is_final: true });

            let next_actions = if request.config.enable_next_actions {
                generate_next_actions(&llm, &request.task, &synthesis).await
            } else {
                Vec::new()
            };
            let _ = tx.send(OrchestrationChunk::NextActions { actions: next_actions.clone() });

            let agent_kinds_used = aggregate_agent_kinds(&dag);
            let sources = dedupe_sources(completed.values().flat_map(|r| r.sources.clone()));
            let steps: usize = completed.values().map(|r| r.steps).sum();
            let success = completed.values().any(|r| r.success);

            let latency_ms = start.elapsed().as_millis() as u64;
            if let Some(writer) = &query_log_writer {
                let normalized_query = normalize_query(&request.task);
                writer.submit_nowait(QueryLogRecord {
                    query_hash: query_hash(&normalized_query),
                    normalized_query,
                    session_id: request.session_id.clone(),
                    user_id: request.user_id.clone(),
                    agent_kinds: agent_kinds_used.clone(),
                    success,
                    latency_ms,
                    timestamp: chrono::Utc::now(),
                });
            }

            let trace_snapshot = trace.finish(Some(dag));
            if let Some(writer) = &trace_writer {
                writer.submit_nowait(trace_snapshot.clone());
            }

            let response = OrchestrationResponse {
                answer: synthesis,
                agent_kinds_used,
                sources,
                steps,
                success,
                next_actions,
                trace: trace_snapshot,
            };
            let _ = tx.send(OrchestrationChunk::Done { response });
        });

        rx
    }
}
