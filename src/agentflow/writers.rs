//! Buffered persistence writers (spec §4.9): `TraceWriter` and `QueryLogWriter`, both
//! batch-size/timeout-triggered, at-most-once, and failure-tolerant so a storage hiccup
//! never blocks the request path that submitted to them.
//!
//! Grounded on `original_source/app/api/infrastructure/services/trace_writer.py` and
//! `query_log_writer.py`: lock-guarded buffer, flush-on-full, periodic background flush,
//! `start`/`stop` lifecycle with a final flush on stop, and (for the query log) a
//! per-record aggregate upsert plus an every-Nth-flush FAQ sync. There is no teacher
//! analog for a buffered remote writer; `thought_chain.rs`'s append-only buffered-write
//! idiom is the closest shape in `CloudLLM-ai-cloudllm` and is generalized here from a
//! single in-process log to a `Repository`-backed remote sink.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::trace::ExecutionTrace;
use super::types::QueryLogRecord;

/// Batch size/timeout defaults for [`TraceWriter`] (spec §4.9).
pub const DEFAULT_TRACE_BATCH_SIZE: usize = 100;
pub const DEFAULT_TRACE_BATCH_TIMEOUT_SECS: f64 = 5.0;

/// Batch size/timeout/FAQ-sync defaults for [`QueryLogWriter`] (spec §4.9).
pub const DEFAULT_QUERY_LOG_BATCH_SIZE: usize = 50;
pub const DEFAULT_QUERY_LOG_BATCH_TIMEOUT_SECS: f64 = 10.0;
pub const DEFAULT_FAQ_SYNC_INTERVAL: u32 = 5;
pub const MIN_FAQ_FREQUENCY: u32 = 3;

/// A storage backend a buffered writer flushes batches into.
///
/// One trait covers both writers: `insert_batch` is the only method a trace repository
/// needs, so `upsert_aggregate`/`sync_dynamic_faq_items` default to no-ops rather than
/// forcing every implementation to provide query-log-specific behavior it has no use
/// for. A `QueryLogWriter`'s repository overrides all three.
#[async_trait]
pub trait Repository: Send + Sync {
    type Item: Send;

    /// Persist a batch of items (spec §4.9's `batch_insert_traces`/`batch_insert_query_logs`).
    async fn insert_batch(&self, items: Vec<Self::Item>) -> Result<(), String>;

    /// Update or create the per-normalized-query rollup a [`QueryLogWriter`] maintains.
    async fn upsert_aggregate(&self, _normalized_query: &str, _success: bool, _latency_ms: u64) -> Result<(), String> {
        Ok(())
    }

    /// Promote normalized queries seen at least `min_frequency` times into the FAQ table.
    async fn sync_dynamic_faq_items(&self, _min_frequency: u32) -> Result<(), String> {
        Ok(())
    }
}

/// Batches [`ExecutionTrace`]s and flushes them to a [`Repository`] on a size or time
/// trigger (spec §4.9).
pub struct TraceWriter<R: Repository<Item = ExecutionTrace> + 'static> {
    repository: Arc<R>,
    buffer: Mutex<Vec<ExecutionTrace>>,
    batch_size: usize,
    batch_timeout: Duration,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<R: Repository<Item = ExecutionTrace> + 'static> TraceWriter<R> {
    pub fn new(repository: Arc<R>) -> Self {
        Self::with_batch_params(repository, DEFAULT_TRACE_BATCH_SIZE, Duration::from_secs_f64(DEFAULT_TRACE_BATCH_TIMEOUT_SECS))
    }

    pub fn with_batch_params(repository: Arc<R>, batch_size: usize, batch_timeout: Duration) -> Self {
        Self {
            repository,
            buffer: Mutex::new(Vec::new()),
            batch_size,
            batch_timeout,
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    /// Start the periodic background flush. Idempotent: calling this twice on an
    /// already-running writer is a no-op.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while this.running.load(Ordering::SeqCst) {
                tokio::time::sleep(this.batch_timeout).await;
                if let Err(e) = this.flush().await {
                    warn!("trace writer: periodic flush failed: {e}");
                }
            }
        });
        *self.task.lock().await = Some(handle);
    }

    /// Stop the background flush and perform one final flush so nothing buffered is lost.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
        if let Err(e) = self.flush().await {
            warn!("trace writer: final flush on stop failed: {e}");
        }
    }

    /// Buffer `trace`, flushing immediately if the buffer is now full.
    pub async fn submit(&self, trace: ExecutionTrace) {
        let should_flush = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(trace);
            buffer.len() >= self.batch_size
        };
        if should_flush {
            if let Err(e) = self.flush().await {
                warn!("trace writer: flush-on-full failed: {e}");
            }
        }
    }

    /// Fire-and-forget variant of [`Self::submit`] for callers on the request path that
    /// cannot afford to await persistence (spec §4.9 "non-blocking").
    pub fn submit_nowait(self: &Arc<Self>, trace: ExecutionTrace) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.submit(trace).await });
    }

    async fn flush(&self) -> Result<(), String> {
        let batch = {
            let mut buffer = self.buffer.lock().await;
            if buffer.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *buffer)
        };
        // TODO: dead-letter queue for batches that still fail here; today a failed flush
        // is logged and dropped (at-most-once).
        self.repository.insert_batch(batch).await
    }
}

/// Batches [`QueryLogRecord`]s, flushes them to a [`Repository`], and upkeeps the
/// per-query aggregate and FAQ tables a query-log repository maintains (spec §4.9).
pub struct QueryLogWriter<R: Repository<Item = QueryLogRecord> + 'static> {
    repository: Arc<R>,
    buffer: Mutex<Vec<QueryLogRecord>>,
    batch_size: usize,
    batch_timeout: Duration,
    faq_sync_interval: u32,
    flush_count: AtomicU32,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<R: Repository<Item = QueryLogRecord> + 'static> QueryLogWriter<R> {
    pub fn new(repository: Arc<R>) -> Self {
        Self::with_batch_params(
            repository,
            DEFAULT_QUERY_LOG_BATCH_SIZE,
            Duration::from_secs_f64(DEFAULT_QUERY_LOG_BATCH_TIMEOUT_SECS),
            DEFAULT_FAQ_SYNC_INTERVAL,
        )
    }

    pub fn with_batch_params(repository: Arc<R>, batch_size: usize, batch_timeout: Duration, faq_sync_interval: u32) -> Self {
        Self {
            repository,
            buffer: Mutex::new(Vec::new()),
            batch_size,
            batch_timeout,
            faq_sync_interval,
            flush_count: AtomicU32::new(0),
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while this.running.load(Ordering::SeqCst) {
                tokio::time::sleep(this.batch_timeout).await;
                if let Err(e) = this.flush().await {
                    warn!("query log writer: periodic flush failed: {e}");
                }
            }
        });
        *self.task.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
        if let Err(e) = self.flush().await {
            warn!("query log writer: final flush on stop failed: {e}");
        }
    }

    pub async fn submit(&self, record: QueryLogRecord) {
        let should_flush = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(record);
            buffer.len() >= self.batch_size
        };
        if should_flush {
            if let Err(e) = self.flush().await {
                warn!("query log writer: flush-on-full failed: {e}");
            }
        }
    }

    pub fn submit_nowait(self: &Arc<Self>, record: QueryLogRecord) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.submit(record).await });
    }

    async fn flush(&self) -> Result<(), String> {
        let batch = {
            let mut buffer = self.buffer.lock().await;
            if buffer.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *buffer)
        };

        let records_for_aggregates = batch.clone();
        // TODO: dead-letter queue for batches that still fail here; today a failed flush
        // is logged and dropped (at-most-once).
        self.repository.insert_batch(batch).await?;

        for record in &records_for_aggregates {
            if let Err(e) = self.repository.upsert_aggregate(&record.normalized_query, record.success, record.latency_ms).await {
                warn!("query log writer: aggregate upsert failed for '{}': {e}", record.normalized_query);
            }
        }

        let flushes_so_far = self.flush_count.fetch_add(1, Ordering::SeqCst) + 1;
        if flushes_so_far % self.faq_sync_interval == 0 {
            if let Err(e) = self.repository.sync_dynamic_faq_items(MIN_FAQ_FREQUENCY).await {
                warn!("query log writer: FAQ sync failed: {e}");
            }
        }
        Ok(())
    }
}
