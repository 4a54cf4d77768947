//! Trace Context: per-request span tree, scoped acquisition, and the event log that
//! becomes an [`ExecutionTrace`] (spec §3, §4.9's "Trace Context" row, §4.12 equivalent).
//!
//! Grounded on `event.rs`'s lifecycle-event-enum pattern (`AgentEvent`/`OrchestrationEvent`)
//! generalized from a flat callback-handler system into a Span tree with explicit
//! start/end/latency/status, and on the scoped-span shape of
//! `original_source/app/api/core/trace_context.py` / `tracing.py`.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::TaskDAG;

/// The category of work a [`Span`] covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Orchestration,
    IntentClassification,
    DagBuild,
    Batch,
    Subtask,
    ToolCall,
    Evaluation,
    Synthesis,
}

/// Terminal outcome of a [`Span`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Ok,
    Error,
    Timeout,
    Cancelled,
}

/// A scoped time interval within a request trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub span_id: String,
    pub trace_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub kind: SpanKind,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub latency_ms: Option<u64>,
    pub status: Option<SpanStatus>,
    pub error: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Span {
    fn open(trace_id: &str, parent_id: Option<String>, name: impl Into<String>, kind: SpanKind) -> Self {
        Self {
            span_id: Uuid::new_v4().to_string(),
            trace_id: trace_id.to_string(),
            parent_id,
            name: name.into(),
            kind,
            start: Utc::now(),
            end: None,
            latency_ms: None,
            status: None,
            error: None,
            metadata: serde_json::Map::new(),
        }
    }

    fn close(&mut self, status: SpanStatus, error: Option<String>) {
        if self.end.is_some() {
            return;
        }
        let now = Utc::now();
        self.end = Some(now);
        self.latency_ms = Some((now - self.start).num_milliseconds().max(0) as u64);
        self.status = Some(status);
        self.error = error;
    }
}

/// One entry in the ordered event log a trace accumulates alongside its span tree
/// (batch start/complete, task start/complete/timeout/error, evaluations, synthesis
/// metadata, next actions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub detail: serde_json::Value,
}

struct TraceInner {
    trace_id: String,
    spans: Vec<Span>,
    events: Vec<TraceEvent>,
    started_at: DateTime<Utc>,
}

/// Per-request span tree with scoped acquisition and an ordered event log.
///
/// Cheaply cloneable: the inner state lives behind an `Arc<Mutex<..>>` so every
/// subtask running under the same request shares one trace without needing to thread
/// a `&mut` reference through the parallel executor's spawned tasks.
#[derive(Clone)]
pub struct TraceContext {
    inner: Arc<Mutex<TraceInner>>,
}

/// An RAII guard returned by [`TraceContext::span`]. Closes the span (recording
/// latency) on drop with [`SpanStatus::Ok`] unless [`SpanGuard::end`] was already
/// called explicitly with a different status.
pub struct SpanGuard {
    trace: TraceContext,
    span_id: String,
    ended: bool,
}

impl SpanGuard {
    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    /// Explicitly end the span with a specific status, instead of relying on drop's
    /// default `Ok`.
    pub fn end(mut self, status: SpanStatus, error: Option<String>) {
        self.trace.close_span(&self.span_id, status, error);
        self.ended = true;
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if !self.ended {
            self.trace.close_span(&self.span_id, SpanStatus::Ok, None);
        }
    }
}

impl TraceContext {
    pub fn new() -> Self {
        let trace_id = Uuid::new_v4().to_string();
        Self {
            inner: Arc::new(Mutex::new(TraceInner {
                trace_id,
                spans: Vec::new(),
                events: Vec::new(),
                started_at: Utc::now(),
            })),
        }
    }

    pub fn trace_id(&self) -> String {
        self.inner.lock().expect("trace mutex poisoned").trace_id.clone()
    }

    /// Open a child span under `parent_id` (or a root span if `None`), returning a
    /// scoped guard that closes it on drop or explicit [`SpanGuard::end`].
    pub fn span(&self, parent_id: Option<&str>, name: impl Into<String>, kind: SpanKind) -> SpanGuard {
        let trace_id = self.trace_id();
        let span = Span::open(&trace_id, parent_id.map(str::to_string), name, kind);
        let span_id = span.span_id.clone();
        self.inner.lock().expect("trace mutex poisoned").spans.push(span);
        SpanGuard { trace: self.clone(), span_id, ended: false }
    }

    fn close_span(&self, span_id: &str, status: SpanStatus, error: Option<String>) {
        let mut inner = self.inner.lock().expect("trace mutex poisoned");
        if let Some(span) = inner.spans.iter_mut().find(|s| s.span_id == span_id) {
            span.close(status, error);
        }
    }

    /// Append an event to the ordered log (spec §3 "ExecutionTrace").
    pub fn record_event(&self, kind: impl Into<String>, detail: serde_json::Value) {
        let mut inner = self.inner.lock().expect("trace mutex poisoned");
        inner.events.push(TraceEvent { timestamp: Utc::now(), kind: kind.into(), detail });
    }

    /// Snapshot the current span tree (closed and open spans alike).
    pub fn spans(&self) -> Vec<Span> {
        self.inner.lock().expect("trace mutex poisoned").spans.clone()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.inner.lock().expect("trace mutex poisoned").events.clone()
    }

    /// Seal this trace and the given DAG into an [`ExecutionTrace`] ready for the
    /// [`super::writers::TraceWriter`].
    pub fn finish(&self, dag: Option<TaskDAG>) -> ExecutionTrace {
        let inner = self.inner.lock().expect("trace mutex poisoned");
        let end = Utc::now();
        ExecutionTrace {
            trace_id: inner.trace_id.clone(),
            dag,
            spans: inner.spans.clone(),
            events: inner.events.clone(),
            start: inner.started_at,
            end,
            elapsed_ms: (end - inner.started_at).num_milliseconds().max(0) as u64,
        }
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}

/// The sealed record of one request's execution: its DAG (if any), span tree, and
/// ordered event log (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub trace_id: String,
    pub dag: Option<TaskDAG>,
    pub spans: Vec<Span>,
    pub events: Vec<TraceEvent>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub elapsed_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_closes_with_ok_status_on_drop() {
        let trace = TraceContext::new();
        {
            let _guard = trace.span(None, "orchestration", SpanKind::Orchestration);
        }
        let spans = trace.spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].status, Some(SpanStatus::Ok));
        assert!(spans[0].latency_ms.is_some());
    }

    #[test]
    fn explicit_end_overrides_the_drop_default() {
        let trace = TraceContext::new();
        let guard = trace.span(None, "subtask:t1", SpanKind::Subtask);
        guard.end(SpanStatus::Timeout, Some("deadline exceeded".to_string()));
        let spans = trace.spans();
        assert_eq!(spans[0].status, Some(SpanStatus::Timeout));
        assert_eq!(spans[0].error.as_deref(), Some("deadline exceeded"));
    }

    #[test]
    fn child_spans_carry_the_parent_id() {
        let trace = TraceContext::new();
        let root = trace.span(None, "orchestration", SpanKind::Orchestration);
        let child = trace.span(Some(root.span_id()), "batch:0", SpanKind::Batch);
        assert_eq!(trace.spans().iter().find(|s| s.span_id == child.span_id).unwrap().parent_id.as_deref(), Some(root.span_id()));
    }

    #[test]
    fn events_are_appended_in_order() {
        let trace = TraceContext::new();
        trace.record_event("batch_start", serde_json::json!({ "batch": 0 }));
        trace.record_event("batch_done", serde_json::json!({ "batch": 0 }));
        let events = trace.events();
        assert_eq!(events[0].kind, "batch_start");
        assert_eq!(events[1].kind, "batch_done");
    }

    #[test]
    fn finish_seals_spans_and_events_into_a_trace() {
        let trace = TraceContext::new();
        let _guard = trace.span(None, "orchestration", SpanKind::Orchestration);
        trace.record_event("orchestration_start", serde_json::json!({}));
        let sealed = trace.finish(None);
        assert_eq!(sealed.spans.len(), 1);
        assert_eq!(sealed.events.len(), 1);
    }
}
