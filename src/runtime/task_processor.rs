// src/runtime/task_processor.rs
//! Bounded-concurrency task processor
//!
//! Handlers that fan one request out into many independent sub-tasks (one
//! per URL, one per document, ...) run them through [`TaskProcessor`]:
//!
//! - at most `concurrency_limit` operations in flight (semaphore gate)
//! - per-item retry with capped exponential backoff
//! - TTL result cache consulted before any work
//! - per-item records in submission order plus aggregate stats
//!
//! Sequential mode goes through the same cache and retry path, so it yields
//! the same per-item outcomes as parallel mode.

use crate::runtime::ttl_cache::TtlCache;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Retry settings for one item
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Configuration for the task processor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Maximum operations in flight (default: 5)
    pub concurrency_limit: usize,

    /// Process batches of more than one item concurrently
    pub parallel: bool,

    pub cache_enabled: bool,
    pub cache_ttl_ms: u64,

    pub retry: RetryPolicy,

    /// Ceiling for a whole batch; unfinished items fail with `timeout`
    pub batch_deadline_ms: Option<u64>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 5,
            parallel: true,
            cache_enabled: true,
            cache_ttl_ms: 5 * 60 * 1000,
            retry: RetryPolicy::default(),
            batch_deadline_ms: None,
        }
    }
}

/// Category of an item failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskErrorKind {
    Network,
    Timeout,
    InvalidInput,
    Forbidden,
    NotFound,
    ServerError,
    ContentError,
}

impl TaskErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskErrorKind::Network => "network",
            TaskErrorKind::Timeout => "timeout",
            TaskErrorKind::InvalidInput => "invalid-input",
            TaskErrorKind::Forbidden => "forbidden",
            TaskErrorKind::NotFound => "not-found",
            TaskErrorKind::ServerError => "server-error",
            TaskErrorKind::ContentError => "content-error",
        }
    }

    /// Classify a failure from its HTTP status and message
    ///
    /// The status wins when it is conclusive. Messages with no recognizable
    /// hint are treated as network failures.
    pub fn categorize(status: Option<u16>, message: &str) -> Self {
        match status {
            Some(400) | Some(422) => return TaskErrorKind::InvalidInput,
            Some(401) | Some(403) => return TaskErrorKind::Forbidden,
            Some(404) | Some(410) => return TaskErrorKind::NotFound,
            Some(408) | Some(504) => return TaskErrorKind::Timeout,
            Some(s) if (500..600).contains(&s) => return TaskErrorKind::ServerError,
            _ => {}
        }

        let message = message.to_lowercase();
        let mentions = |needles: &[&str]| needles.iter().any(|n| message.contains(n));

        if mentions(&["timeout", "timed out", "deadline"]) {
            TaskErrorKind::Timeout
        } else if mentions(&["forbidden", "unauthorized", "access denied"]) {
            TaskErrorKind::Forbidden
        } else if mentions(&["not found", "no such"]) {
            TaskErrorKind::NotFound
        } else if mentions(&["invalid", "malformed", "unsupported"]) {
            TaskErrorKind::InvalidInput
        } else if mentions(&["parse", "decode", "empty content", "no content"]) {
            TaskErrorKind::ContentError
        } else if mentions(&["internal server", "bad gateway", "service unavailable"]) {
            TaskErrorKind::ServerError
        } else {
            TaskErrorKind::Network
        }
    }
}

impl fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of one item
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
    pub status: Option<u16>,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    /// Build an error whose kind is derived from status and message
    pub fn categorized(status: Option<u16>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: TaskErrorKind::categorize(status, &message),
            message,
            status,
        }
    }
}

/// Stable cache identity of an item
pub trait TaskKey {
    fn task_key(&self) -> String;
}

impl TaskKey for String {
    fn task_key(&self) -> String {
        self.clone()
    }
}

impl TaskKey for &str {
    fn task_key(&self) -> String {
        (*self).to_string()
    }
}

/// Size of a successful result, summed into batch stats
pub trait ContentSize {
    fn content_size(&self) -> usize;
}

impl ContentSize for String {
    fn content_size(&self) -> usize {
        self.len()
    }
}

/// Outcome of one item
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord<V> {
    pub key: String,
    pub outcome: Result<V, TaskError>,
    pub cached: bool,
    pub retry_attempts: u32,
    pub latency_ms: u64,
}

impl<V> TaskRecord<V> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub cached: usize,
    pub min_latency_ms: u64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: u64,
    pub total_content_size: usize,
    pub total_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMethod {
    Parallel,
    Sequential,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport<V> {
    /// One record per item, in submission order
    pub records: Vec<TaskRecord<V>>,
    pub stats: BatchStats,
    pub processing_method: ProcessingMethod,
}

impl<V: ContentSize> BatchReport<V> {
    fn new(records: Vec<TaskRecord<V>>, processing_method: ProcessingMethod) -> Self {
        let mut stats = BatchStats {
            total: records.len(),
            ..Default::default()
        };

        if !records.is_empty() {
            let mut latency_sum = 0u64;
            stats.min_latency_ms = u64::MAX;

            for record in &records {
                match &record.outcome {
                    Ok(value) => {
                        stats.successful += 1;
                        stats.total_content_size += value.content_size();
                    }
                    Err(_) => stats.failed += 1,
                }
                if record.cached {
                    stats.cached += 1;
                }
                stats.total_retries += record.retry_attempts;
                stats.min_latency_ms = stats.min_latency_ms.min(record.latency_ms);
                stats.max_latency_ms = stats.max_latency_ms.max(record.latency_ms);
                latency_sum += record.latency_ms;
            }

            stats.avg_latency_ms = latency_sum as f64 / records.len() as f64;
        }

        Self {
            records,
            stats,
            processing_method,
        }
    }
}

/// Runs batches of independent operations under a concurrency ceiling
pub struct TaskProcessor<V> {
    config: ProcessorConfig,
    cache: TtlCache<String, V>,
}

impl<V> TaskProcessor<V>
where
    V: Clone + ContentSize + Send + Sync,
{
    pub fn new(config: ProcessorConfig) -> Self {
        let cache = TtlCache::new(Duration::from_millis(config.cache_ttl_ms));
        Self { config, cache }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    /// Run `op` once per item and collect the outcomes
    pub async fn process<I, F, Fut>(&self, items: Vec<I>, op: F) -> BatchReport<V>
    where
        I: TaskKey,
        F: Fn(&I) -> Fut,
        Fut: Future<Output = Result<V, TaskError>>,
    {
        if self.config.cache_enabled {
            let purged = self.cache.purge_expired();
            if purged > 0 {
                debug!("Purged {} expired task results", purged);
            }
        }

        let deadline = self
            .config
            .batch_deadline_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        let op = &op;

        let (records, method) = if items.len() > 1 && self.config.parallel {
            let gate = Arc::new(Semaphore::new(self.config.concurrency_limit.max(1)));
            let records = join_all(items.iter().map(|item| {
                let gate = Arc::clone(&gate);
                async move {
                    let started = Instant::now();
                    let outcome = async {
                        // Cache hits never wait for a slot
                        if let Some(record) = self.cached_record(item, started) {
                            return record;
                        }
                        // The gate is never closed
                        let _permit = gate.acquire().await.ok();
                        self.run_item(item, op, started).await
                    };
                    self.bounded(item, outcome, deadline, started).await
                }
            }))
            .await;
            (records, ProcessingMethod::Parallel)
        } else {
            let mut records = Vec::with_capacity(items.len());
            for item in &items {
                let started = Instant::now();
                let outcome = self.process_item(item, op, started);
                records.push(self.bounded(item, outcome, deadline, started).await);
            }
            (records, ProcessingMethod::Sequential)
        };

        let report = BatchReport::new(records, method);
        debug!(
            "Processed {} tasks ({} ok, {} failed, {} cached) via {:?}",
            report.stats.total,
            report.stats.successful,
            report.stats.failed,
            report.stats.cached,
            report.processing_method
        );
        report
    }

    /// Apply the batch deadline to one item
    async fn bounded<I, Fut>(
        &self,
        item: &I,
        outcome: Fut,
        deadline: Option<Instant>,
        started: Instant,
    ) -> TaskRecord<V>
    where
        I: TaskKey,
        Fut: Future<Output = TaskRecord<V>>,
    {
        let Some(deadline) = deadline else {
            return outcome.await;
        };

        match tokio::time::timeout_at(deadline, outcome).await {
            Ok(record) => record,
            Err(_) => {
                metrics::counter!("dispatch_tasks_total", "outcome" => "failure").increment(1);
                TaskRecord {
                    key: item.task_key(),
                    outcome: Err(TaskError::new(
                        TaskErrorKind::Timeout,
                        "Batch deadline exceeded",
                    )),
                    cached: false,
                    retry_attempts: 0,
                    latency_ms: started.elapsed().as_millis() as u64,
                }
            }
        }
    }

    async fn process_item<I, F, Fut>(&self, item: &I, op: &F, started: Instant) -> TaskRecord<V>
    where
        I: TaskKey,
        F: Fn(&I) -> Fut,
        Fut: Future<Output = Result<V, TaskError>>,
    {
        match self.cached_record(item, started) {
            Some(record) => record,
            None => self.run_item(item, op, started).await,
        }
    }

    fn cached_record<I: TaskKey>(&self, item: &I, started: Instant) -> Option<TaskRecord<V>> {
        if !self.config.cache_enabled {
            return None;
        }

        let key = item.task_key();
        let value = self.cache.get(&key)?;
        metrics::counter!("dispatch_tasks_total", "outcome" => "cached").increment(1);

        Some(TaskRecord {
            key,
            outcome: Ok(value),
            cached: true,
            retry_attempts: 0,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Run `op` with retries and cache a success
    async fn run_item<I, F, Fut>(&self, item: &I, op: &F, started: Instant) -> TaskRecord<V>
    where
        I: TaskKey,
        F: Fn(&I) -> Fut,
        Fut: Future<Output = Result<V, TaskError>>,
    {
        let key = item.task_key();
        let policy = &self.config.retry;
        let mut retries = 0;

        let outcome = loop {
            match op(item).await {
                Ok(value) => break Ok(value),
                Err(e) if retries < policy.max_attempts => {
                    retries += 1;
                    let delay = policy.delay_for(retries);
                    debug!("Task {} failed ({}), retry {} in {:?}", key, e, retries, delay);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!("Task {} failed after {} attempts: {}", key, retries + 1, e);
                    break Err(e);
                }
            }
        };

        let label = if outcome.is_ok() { "success" } else { "failure" };
        metrics::counter!("dispatch_tasks_total", "outcome" => label).increment(1);

        if let (true, Ok(value)) = (self.config.cache_enabled, &outcome) {
            self.cache.insert(key.clone(), value.clone());
        }

        TaskRecord {
            key,
            outcome,
            cached: false,
            retry_attempts: retries,
            latency_ms: started.elapsed().as_millis() as u64,
        }
    }
}
