// src/runtime/test_support.rs
//! Scripted handler used by runtime, pool and dispatcher tests

use crate::runtime::handler::{ChunkStream, Handler, HandlerError, HandlerFactory, HandlerOutput};
use crate::runtime::types::{Environment, ExecutionContext, HandlerConfig, HandlerType};
use crate::utils::errors::Result;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub(crate) enum Behavior {
    Respond(String),
    Sleep(Duration, String),
    Fail(String),
    FailUnknown(String),
    Panic,
}

/// Shared counters observed by tests
#[derive(Debug, Default, Clone)]
pub(crate) struct Counters {
    pub calls: Arc<AtomicUsize>,
    pub cancelled: Arc<AtomicBool>,
    pub cleanups: Arc<AtomicUsize>,
    pub created: Arc<AtomicUsize>,
    pub unhealthy: Arc<AtomicBool>,
    /// Make every cleanup report an error
    pub fail_cleanup: Arc<AtomicBool>,
}

impl Counters {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

pub(crate) struct MockHandler {
    pub behavior: Behavior,
    pub counters: Counters,
    pub stream_chunks: Option<Vec<String>>,
    pub required_param: Option<&'static str>,
    pub init_delay: Duration,
    /// Sequence number assigned at creation, used to tell instances apart
    pub serial: usize,
}

impl MockHandler {
    pub fn new(behavior: Behavior, counters: Counters) -> Self {
        let serial = counters.created.fetch_add(1, Ordering::SeqCst) + 1;
        Self {
            behavior,
            counters,
            stream_chunks: None,
            required_param: None,
            init_delay: Duration::ZERO,
            serial,
        }
    }
}

#[async_trait]
impl Handler for MockHandler {
    async fn initialize(&self, _config: &HandlerConfig) -> std::result::Result<(), HandlerError> {
        if !self.init_delay.is_zero() {
            tokio::time::sleep(self.init_delay).await;
        }
        Ok(())
    }

    async fn execute_once(
        &self,
        _config: &HandlerConfig,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
    ) -> std::result::Result<HandlerOutput, HandlerError> {
        self.counters.calls.fetch_add(1, Ordering::SeqCst);

        match &self.behavior {
            Behavior::Respond(content) => Ok(HandlerOutput::new(content.clone())
                .with_metadata("serial", serde_json::json!(self.serial))
                .with_metadata("query", serde_json::json!(ctx.query))),
            Behavior::Sleep(delay, content) => {
                // Detached backend work that only stops through the token
                let delay = *delay;
                let cancelled = Arc::clone(&self.counters.cancelled);
                let work = tokio::spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => true,
                        _ = cancel.cancelled() => {
                            cancelled.store(true, Ordering::SeqCst);
                            false
                        }
                    }
                });

                match work.await {
                    Ok(true) => Ok(HandlerOutput::new(content.clone())),
                    _ => Err(HandlerError::execution("cancelled")),
                }
            }
            Behavior::Fail(message) => Err(HandlerError::execution(message.clone())),
            Behavior::FailUnknown(message) => Err(anyhow::anyhow!(message.clone()).into()),
            Behavior::Panic => panic!("handler exploded"),
        }
    }

    fn execute_streaming<'a>(
        &'a self,
        _config: &'a HandlerConfig,
        _ctx: &'a ExecutionContext,
        _cancel: CancellationToken,
    ) -> Option<ChunkStream<'a>> {
        let chunks = self.stream_chunks.clone()?;
        Some(futures::stream::iter(chunks.into_iter().map(Ok)).boxed())
    }

    fn validate_specific_config(&self, config: &HandlerConfig) -> Vec<String> {
        match self.required_param {
            Some(param) if !config.parameters.contains_key(param) => {
                vec![format!("parameters.{} is required", param)]
            }
            _ => Vec::new(),
        }
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["mock".to_string()]
    }

    async fn perform_health_check(&self) -> bool {
        !self.counters.unhealthy.load(Ordering::SeqCst)
    }

    async fn perform_cleanup(&self) -> std::result::Result<(), HandlerError> {
        self.counters.cleanups.fetch_add(1, Ordering::SeqCst);
        if self.counters.fail_cleanup.load(Ordering::SeqCst) {
            return Err(HandlerError::execution("socket already closed"));
        }
        Ok(())
    }
}

pub(crate) fn test_config(handler_type: HandlerType, model_id: &str) -> HandlerConfig {
    HandlerConfig::new(
        format!("{}-{}", handler_type, model_id),
        "Test Handler",
        handler_type,
        Environment::HostedModel,
        model_id,
    )
}

pub(crate) fn test_context(query: &str) -> ExecutionContext {
    ExecutionContext::new(query, "alice", "test-model", "en-US")
}

/// Factory building `MockHandler`s that share one counters
pub(crate) fn mock_factory(behavior: Behavior, counters: Counters) -> impl HandlerFactory {
    slow_init_factory(behavior, counters, Duration::ZERO)
}

/// Like `mock_factory`, but every instance takes `init_delay` to initialize
pub(crate) fn slow_init_factory(
    behavior: Behavior,
    counters: Counters,
    init_delay: Duration,
) -> impl HandlerFactory {
    move |_config: &HandlerConfig| -> Result<Box<dyn Handler>> {
        let mut handler = MockHandler::new(behavior.clone(), counters.clone());
        handler.init_delay = init_delay;
        Ok(Box::new(handler))
    }
}
