// src/observability/telemetry.rs
//! Execution telemetry
//!
//! The runtime records one `ExecutionEvent` per `execute` call. Recording
//! never blocks the caller: events go into a bounded lock-free queue and a
//! background writer drains them in batches to a `TelemetrySink`.
//!
//! ```text
//! execute() → record() → ArrayQueue → Background Writer → Sink
//!                          (drops          (batch or
//!                           when full)      interval)
//! ```

use crate::runtime::types::{ErrorCode, HandlerType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Execution outcome reported to the sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure { code: ErrorCode, message: String },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure { .. } => "failure",
        }
    }
}

/// One handler execution, as seen by telemetry consumers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub started_at: DateTime<Utc>,
    pub handler_id: String,
    pub handler_type: HandlerType,
    pub model_id: String,
    pub user: String,
    pub correlation_id: String,
    pub outcome: Outcome,
    pub duration_ms: u64,
    pub streaming: bool,
}

/// Destination for batches of execution events
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn deliver(&self, events: &[ExecutionEvent]) -> anyhow::Result<()>;
}

/// Sink writing each event as a structured log line
#[derive(Debug, Default, Clone)]
pub struct LogSink;

#[async_trait]
impl TelemetrySink for LogSink {
    async fn deliver(&self, events: &[ExecutionEvent]) -> anyhow::Result<()> {
        for event in events {
            info!(
                target: "dispatch::telemetry",
                handler_id = %event.handler_id,
                handler_type = %event.handler_type,
                model_id = %event.model_id,
                user = %event.user,
                correlation_id = %event.correlation_id,
                outcome = event.outcome.label(),
                duration_ms = event.duration_ms,
                streaming = event.streaming,
                "execution"
            );
        }
        Ok(())
    }
}

/// Telemetry recorder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Maximum buffered events before new ones are dropped
    pub queue_capacity: usize,

    /// Events per sink delivery
    pub batch_size: usize,

    /// Periodic flush interval (milliseconds)
    pub flush_interval_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_size: 100,
            flush_interval_ms: 1_000,
        }
    }
}

/// Bounded lock-free event queue
struct EventQueue {
    queue: ArrayQueue<ExecutionEvent>,
    push_count: AtomicU64,
    drop_count: AtomicU64,
}

impl EventQueue {
    fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            push_count: AtomicU64::new(0),
            drop_count: AtomicU64::new(0),
        }
    }

    fn push(&self, event: ExecutionEvent) -> bool {
        match self.queue.push(event) {
            Ok(()) => {
                self.push_count.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.drop_count.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    fn pop_batch(&self, max: usize) -> Vec<ExecutionEvent> {
        let mut batch = Vec::with_capacity(max.min(self.queue.len()));
        while batch.len() < max {
            match self.queue.pop() {
                Some(event) => batch.push(event),
                None => break,
            }
        }
        batch
    }
}

/// Recorder statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct TelemetryStats {
    pub events_recorded: u64,
    pub events_dropped: u64,
    pub events_delivered: u64,
    pub batches_delivered: u64,
    pub delivery_failures: u64,
    pub queued: usize,
}

/// Non-blocking execution event recorder
pub struct TelemetryRecorder {
    config: TelemetryConfig,
    queue: Arc<EventQueue>,
    sink: Arc<dyn TelemetrySink>,
    flush_notify: Arc<Notify>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
    delivered: Arc<AtomicU64>,
    batches: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
}

impl TelemetryRecorder {
    pub fn new(config: TelemetryConfig, sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            queue: Arc::new(EventQueue::new(config.queue_capacity)),
            config,
            sink,
            flush_notify: Arc::new(Notify::new()),
            writer_handle: Mutex::new(None),
            delivered: Arc::new(AtomicU64::new(0)),
            batches: Arc::new(AtomicU64::new(0)),
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Recorder writing to the log sink with default settings
    pub fn logging() -> Self {
        Self::new(TelemetryConfig::default(), Arc::new(LogSink))
    }

    /// Start the background writer. Calling it again is a no-op.
    pub fn start(&self) {
        let mut handle = self.writer_handle.lock();
        if handle.is_some() {
            return;
        }

        info!("Starting telemetry writer");

        let queue = Arc::clone(&self.queue);
        let sink = Arc::clone(&self.sink);
        let flush_notify = Arc::clone(&self.flush_notify);
        let delivered = Arc::clone(&self.delivered);
        let batches = Arc::clone(&self.batches);
        let failures = Arc::clone(&self.failures);
        let batch_size = self.config.batch_size.max(1);
        let flush_interval = Duration::from_millis(self.config.flush_interval_ms.max(1));

        *handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(flush_interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = flush_notify.notified() => {}
                }

                Self::drain(&queue, sink.as_ref(), batch_size, &delivered, &batches, &failures)
                    .await;
            }
        }));
    }

    /// Queue an event without blocking. Drops the event when the queue is full.
    pub fn record(&self, event: ExecutionEvent) {
        if !self.queue.push(event) {
            metrics::counter!("dispatch_telemetry_dropped_total").increment(1);
            debug!("Telemetry queue full, event dropped");
            return;
        }

        if self.queue.queue.len() >= self.config.batch_size {
            self.flush_notify.notify_one();
        }
    }

    /// Deliver everything queued so far
    pub async fn flush(&self) {
        Self::drain(
            &self.queue,
            self.sink.as_ref(),
            self.config.batch_size.max(1),
            &self.delivered,
            &self.batches,
            &self.failures,
        )
        .await;
    }

    /// Stop the writer and deliver remaining events
    pub async fn shutdown(&self) {
        let handle = self.writer_handle.lock().take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.flush().await;
    }

    pub fn stats(&self) -> TelemetryStats {
        TelemetryStats {
            events_recorded: self.queue.push_count.load(Ordering::Relaxed),
            events_dropped: self.queue.drop_count.load(Ordering::Relaxed),
            events_delivered: self.delivered.load(Ordering::Relaxed),
            batches_delivered: self.batches.load(Ordering::Relaxed),
            delivery_failures: self.failures.load(Ordering::Relaxed),
            queued: self.queue.queue.len(),
        }
    }

    async fn drain(
        queue: &EventQueue,
        sink: &dyn TelemetrySink,
        batch_size: usize,
        delivered: &AtomicU64,
        batches: &AtomicU64,
        failures: &AtomicU64,
    ) {
        loop {
            let batch = queue.pop_batch(batch_size);
            if batch.is_empty() {
                return;
            }

            match sink.deliver(&batch).await {
                Ok(()) => {
                    delivered.fetch_add(batch.len() as u64, Ordering::Relaxed);
                    batches.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    // Sink delivery is best effort; the batch is discarded
                    failures.fetch_add(1, Ordering::Relaxed);
                    warn!("Telemetry sink rejected {} events: {}", batch.len(), e);
                }
            }
        }
    }
}

impl Drop for TelemetryRecorder {
    fn drop(&mut self) {
        if let Some(handle) = self.writer_handle.get_mut().take() {
            handle.abort();
        }
    }
}
