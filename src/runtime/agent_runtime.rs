// src/runtime/agent_runtime.rs
//! Agent runtime for handler lifecycle and execution
//!
//! An `AgentRuntime` is one handler instance: the handler hooks plus the
//! configuration and lifecycle state it owns. It provides the shared
//! execution wrappers every handler type goes through:
//!
//! - Correlation id assignment and context validation
//! - Timeout race with cooperative cancellation of the losing handler work
//! - Panic containment and error shaping into `ExecutionResult`
//! - Usage bookkeeping, metrics and telemetry events
//! - Streaming with a chunked fallback for handlers without native streaming

use crate::observability::telemetry::{ExecutionEvent, Outcome, TelemetryRecorder};
use crate::runtime::handler::{Handler, HandlerOutput};
use crate::runtime::types::{
    ErrorCode, ExecutionContext, ExecutionError, ExecutionResult, HandlerConfig, ResultMetadata,
};
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

/// Execution settings shared by all handler instances
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentRuntimeConfig {
    /// Characters per chunk when streaming a non-streaming handler
    pub stream_chunk_size: usize,

    /// Pause between fallback chunks (milliseconds)
    pub stream_chunk_delay_ms: u64,
}

impl Default for AgentRuntimeConfig {
    fn default() -> Self {
        Self {
            stream_chunk_size: 50,
            stream_chunk_delay_ms: 50,
        }
    }
}

/// Point-in-time view of an instance's lifecycle state
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub instance_id: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub healthy: bool,
    pub usage_count: u64,
    pub in_flight: usize,
    pub state: HashMap<String, Value>,
}

/// One handler instance with its lifecycle state
pub struct AgentRuntime {
    instance_id: String,
    config: HandlerConfig,
    runtime_config: AgentRuntimeConfig,
    handler: Box<dyn Handler>,
    telemetry: Option<Arc<TelemetryRecorder>>,
    created_at: DateTime<Utc>,
    last_used_at: Mutex<Option<DateTime<Utc>>>,
    healthy: AtomicBool,
    usage_count: AtomicU64,
    in_flight: AtomicUsize,
    state: Mutex<HashMap<String, Value>>,
}

impl AgentRuntime {
    /// Create a runtime, rejecting invalid configuration
    pub fn new(config: HandlerConfig, handler: Box<dyn Handler>) -> Result<Self> {
        let errors = Self::collect_config_errors(&config, handler.as_ref());
        if !errors.is_empty() {
            return Err(EngineError::InvalidHandlerConfig(errors));
        }

        Ok(Self {
            instance_id: ids::instance_id(),
            config,
            runtime_config: AgentRuntimeConfig::default(),
            handler,
            telemetry: None,
            created_at: Utc::now(),
            last_used_at: Mutex::new(None),
            healthy: AtomicBool::new(true),
            usage_count: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            state: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_runtime_config(mut self, runtime_config: AgentRuntimeConfig) -> Self {
        self.runtime_config = runtime_config;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<TelemetryRecorder>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Run the handler's one-time setup
    pub async fn initialize(&self) -> Result<()> {
        debug!(handler_id = %self.config.id, "Initializing handler");

        self.handler
            .initialize(&self.config)
            .await
            .map_err(|e| EngineError::CreationFailed {
                handler_type: self.config.handler_type,
                reason: e.to_string(),
            })
    }

    fn collect_config_errors(config: &HandlerConfig, handler: &dyn Handler) -> Vec<String> {
        let mut errors = Vec::new();

        if config.id.trim().is_empty() {
            errors.push("id is required".to_string());
        }
        if config.name.trim().is_empty() {
            errors.push("name is required".to_string());
        }
        if config.model_id.trim().is_empty() {
            errors.push("model_id is required".to_string());
        }
        if config.timeout_ms == 0 {
            errors.push("timeout_ms must be greater than 0".to_string());
        }

        errors.extend(handler.validate_specific_config(config));
        errors
    }

    /// Configuration errors; empty when the instance is usable
    pub fn validate_config(&self) -> Vec<String> {
        Self::collect_config_errors(&self.config, self.handler.as_ref())
    }

    /// Counters liveness and configuration, updating `healthy`
    pub async fn check_health(&self) -> bool {
        let alive = self.handler.perform_health_check().await;
        let healthy = alive && self.validate_config().is_empty();

        if !healthy {
            warn!(handler_id = %self.config.id, "Handler failed health check");
        }

        self.healthy.store(healthy, Ordering::SeqCst);
        healthy
    }

    /// Release handler resources. The instance is unusable afterwards.
    pub async fn cleanup(&self) -> Result<()> {
        self.healthy.store(false, Ordering::SeqCst);
        self.handler
            .perform_cleanup()
            .await
            .map_err(|e| EngineError::CleanupFailed(format!("{}: {}", self.config.id, e)))
    }

    /// Execute one call. Failures are reported in the result, never returned as errors.
    pub async fn execute(&self, mut ctx: ExecutionContext) -> ExecutionResult {
        let correlation_id = self.assign_correlation_id(&mut ctx);
        let span = info_span!(
            "execute",
            handler_id = %self.config.id,
            handler_type = %self.config.handler_type,
            correlation_id = %correlation_id
        );

        self.execute_inner(ctx, correlation_id).instrument(span).await
    }

    async fn execute_inner(&self, ctx: ExecutionContext, correlation_id: String) -> ExecutionResult {
        let started_at = Utc::now();
        let start = Instant::now();

        if let Err(errors) = ctx.validate() {
            debug!("Rejecting invalid execution context: {:?}", errors);
            let error = ExecutionError {
                code: ErrorCode::ValidationError,
                message: format!("Invalid execution context: {}", errors.join("; ")),
                details: Some(json!({ "errors": errors })),
            };
            return self.finish_failure(&ctx, correlation_id, error, started_at, start, false);
        }

        match self.run_once(&ctx).await {
            Ok(output) => {
                let elapsed = elapsed_ms(start);
                self.record_success();
                self.emit(&ctx, &correlation_id, Outcome::Success, started_at, elapsed, false);

                ExecutionResult {
                    content: output.content,
                    agent_id: self.config.id.clone(),
                    agent_type: self.config.handler_type,
                    success: true,
                    correlation_id,
                    metadata: ResultMetadata {
                        processing_time_ms: elapsed,
                        confidence: output.confidence.unwrap_or(1.0).clamp(0.0, 1.0),
                        agent_metadata: output.metadata,
                    },
                    error: None,
                }
            }
            Err(error) => self.finish_failure(&ctx, correlation_id, error, started_at, start, false),
        }
    }

    /// Execute as a stream of text chunks
    ///
    /// Must be called within a tokio runtime. The stream never fails: errors
    /// arrive as a single `"Error: <message>"` chunk. Dropping the stream
    /// cancels the underlying handler work.
    pub fn execute_streaming(self: &Arc<Self>, mut ctx: ExecutionContext) -> BoxStream<'static, String> {
        let correlation_id = self.assign_correlation_id(&mut ctx);
        let span = info_span!(
            "execute_streaming",
            handler_id = %self.config.id,
            handler_type = %self.config.handler_type,
            correlation_id = %correlation_id
        );

        let (tx, rx) = mpsc::channel(16);
        let runtime = Arc::clone(self);
        tokio::spawn(
            async move { runtime.drive_stream(ctx, correlation_id, tx).await }.instrument(span),
        );

        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        })
        .boxed()
    }

    async fn drive_stream(
        &self,
        ctx: ExecutionContext,
        correlation_id: String,
        tx: mpsc::Sender<String>,
    ) {
        let started_at = Utc::now();
        let start = Instant::now();

        if let Err(errors) = ctx.validate() {
            let message = format!("Invalid execution context: {}", errors.join("; "));
            let _ = tx.send(format!("Error: {}", message)).await;
            let error = ExecutionError {
                code: ErrorCode::ValidationError,
                message,
                details: None,
            };
            self.finish_failure(&ctx, correlation_id, error, started_at, start, true);
            return;
        }

        let cancel = CancellationToken::new();
        let _cancel_on_exit = cancel.clone().drop_guard();

        let native = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.handler
                .execute_streaming(&self.config, &ctx, cancel.clone())
        }));

        let result = match native {
            Ok(Some(stream)) => self.forward_native(stream, &tx, &cancel).await,
            Ok(None) => self.stream_fallback(&ctx, &tx, &cancel).await,
            Err(payload) => Err(panic_error(payload)),
        };

        match result {
            Ok(()) => {
                self.record_success();
                self.emit(&ctx, &correlation_id, Outcome::Success, started_at, elapsed_ms(start), true);
            }
            Err(error) => {
                let _ = tx.send(format!("Error: {}", error.message)).await;
                self.finish_failure(&ctx, correlation_id, error, started_at, start, true);
            }
        }
    }

    async fn forward_native(
        &self,
        mut stream: crate::runtime::handler::ChunkStream<'_>,
        tx: &mpsc::Sender<String>,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), ExecutionError> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlightGuard(&self.in_flight);
        let deadline = Instant::now() + self.timeout();

        loop {
            let next = tokio::select! {
                next = AssertUnwindSafe(stream.next()).catch_unwind() => next,
                _ = tokio::time::sleep_until(deadline) => {
                    cancel.cancel();
                    return Err(self.timeout_error());
                }
                _ = tx.closed() => {
                    debug!("Stream consumer went away, cancelling handler");
                    cancel.cancel();
                    return Ok(());
                }
            };

            match next {
                Ok(Some(Ok(chunk))) => {
                    if tx.send(chunk).await.is_err() {
                        cancel.cancel();
                        return Ok(());
                    }
                }
                Ok(Some(Err(e))) => {
                    return Err(ExecutionError {
                        code: e.code(),
                        message: e.to_string(),
                        details: e.details().cloned(),
                    })
                }
                Ok(None) => return Ok(()),
                Err(payload) => return Err(panic_error(payload)),
            }
        }
    }

    async fn stream_fallback(
        &self,
        ctx: &ExecutionContext,
        tx: &mpsc::Sender<String>,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), ExecutionError> {
        let output = tokio::select! {
            output = self.run_once_with(ctx, cancel.clone()) => output?,
            _ = tx.closed() => {
                cancel.cancel();
                return Ok(());
            }
        };

        let delay = Duration::from_millis(self.runtime_config.stream_chunk_delay_ms);
        let chunks = chunk_content(&output.content, self.runtime_config.stream_chunk_size);
        let last = chunks.len().saturating_sub(1);

        for (i, chunk) in chunks.into_iter().enumerate() {
            if tx.send(chunk).await.is_err() {
                break;
            }
            if i < last && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        Ok(())
    }

    async fn run_once(&self, ctx: &ExecutionContext) -> std::result::Result<HandlerOutput, ExecutionError> {
        let cancel = CancellationToken::new();
        // Cancels handler work if the caller drops this future
        let _cancel_on_exit = cancel.clone().drop_guard();
        self.run_once_with(ctx, cancel).await
    }

    /// Race `execute_once` against the configured timeout
    async fn run_once_with(
        &self,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
    ) -> std::result::Result<HandlerOutput, ExecutionError> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlightGuard(&self.in_flight);

        // Building the future inside the guarded block also catches handlers
        // that panic before returning one
        let token = cancel.clone();
        let work = AssertUnwindSafe(async move {
            self.handler.execute_once(&self.config, ctx, token).await
        })
        .catch_unwind();

        tokio::select! {
            outcome = work => match outcome {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(e)) => Err(ExecutionError {
                    code: e.code(),
                    message: e.to_string(),
                    details: e.details().cloned(),
                }),
                Err(payload) => Err(panic_error(payload)),
            },
            _ = tokio::time::sleep(self.timeout()) => {
                cancel.cancel();
                warn!("Handler exceeded {}ms timeout", self.config.timeout_ms);
                Err(self.timeout_error())
            }
        }
    }

    fn finish_failure(
        &self,
        ctx: &ExecutionContext,
        correlation_id: String,
        error: ExecutionError,
        started_at: DateTime<Utc>,
        start: Instant,
        streaming: bool,
    ) -> ExecutionResult {
        let elapsed = elapsed_ms(start);
        debug!(code = %error.code, "Execution failed: {}", error.message);

        self.emit(
            ctx,
            &correlation_id,
            Outcome::Failure {
                code: error.code,
                message: error.message.clone(),
            },
            started_at,
            elapsed,
            streaming,
        );

        ExecutionResult::failure(
            &self.config,
            correlation_id,
            error.code,
            error.message,
            error.details,
            elapsed,
        )
    }

    fn assign_correlation_id(&self, ctx: &mut ExecutionContext) -> String {
        match &ctx.correlation_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => {
                let id = ids::correlation_id(self.config.handler_type);
                ctx.correlation_id = Some(id.clone());
                id
            }
        }
    }

    fn record_success(&self) {
        self.usage_count.fetch_add(1, Ordering::SeqCst);
        *self.last_used_at.lock() = Some(Utc::now());
    }

    fn emit(
        &self,
        ctx: &ExecutionContext,
        correlation_id: &str,
        outcome: Outcome,
        started_at: DateTime<Utc>,
        duration_ms: u64,
        streaming: bool,
    ) {
        let handler_type = self.config.handler_type.as_str();
        metrics::counter!(
            "dispatch_executions_total",
            "type" => handler_type,
            "outcome" => outcome.label()
        )
        .increment(1);
        metrics::histogram!("dispatch_execution_duration_ms", "type" => handler_type)
            .record(duration_ms as f64);

        if let Some(telemetry) = &self.telemetry {
            telemetry.record(ExecutionEvent {
                started_at,
                handler_id: self.config.id.clone(),
                handler_type: self.config.handler_type,
                model_id: self.config.model_id.clone(),
                user: ctx.user.clone(),
                correlation_id: correlation_id.to_string(),
                outcome,
                duration_ms,
                streaming,
            });
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    fn timeout_error(&self) -> ExecutionError {
        ExecutionError {
            code: ErrorCode::TimeoutError,
            message: format!("Execution timed out after {}ms", self.config.timeout_ms),
            details: None,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    pub fn capabilities(&self) -> Vec<String> {
        self.handler.capabilities()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn usage_count(&self) -> u64 {
        self.usage_count.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn last_used_at(&self) -> Option<DateTime<Utc>> {
        *self.last_used_at.lock()
    }

    pub fn set_state(&self, key: impl Into<String>, value: Value) {
        self.state.lock().insert(key.into(), value);
    }

    pub fn state_value(&self, key: &str) -> Option<Value> {
        self.state.lock().get(key).cloned()
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            instance_id: self.instance_id.clone(),
            created_at: self.created_at,
            last_used_at: self.last_used_at(),
            healthy: self.is_healthy(),
            usage_count: self.usage_count(),
            in_flight: self.in_flight(),
            state: self.state.lock().clone(),
        }
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

fn panic_error(payload: Box<dyn Any + Send>) -> ExecutionError {
    let detail = if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };

    ExecutionError {
        code: ErrorCode::UnknownError,
        message: format!("Handler panicked: {}", detail),
        details: None,
    }
}

/// Split content into chunks of at most `size` characters
pub(crate) fn chunk_content(content: &str, size: usize) -> Vec<String> {
    let size = size.max(1);
    let chars: Vec<char> = content.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}
