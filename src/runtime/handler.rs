// src/runtime/handler.rs
//! Handler contract
//!
//! Every specialized task handler implements [`Handler`]. The runtime wraps
//! these hooks with validation, timeouts, cancellation, telemetry and
//! error shaping (see `agent_runtime`), so implementations only contain
//! their own backend logic.

use crate::runtime::types::{ErrorCode, ExecutionContext, HandlerConfig};
use crate::utils::errors::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Failure raised by handler logic
///
/// `Coded` failures keep their code in the reported result; anything else
/// is reported as `UNKNOWN_ERROR`.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{message}")]
    Coded {
        code: ErrorCode,
        message: String,
        details: Option<Value>,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn execution(message: impl Into<String>) -> Self {
        HandlerError::Coded {
            code: ErrorCode::ExecutionError,
            message: message.into(),
            details: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        HandlerError::Coded {
            code: ErrorCode::ValidationError,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(self, details: Value) -> Self {
        match self {
            HandlerError::Coded { code, message, .. } => HandlerError::Coded {
                code,
                message,
                details: Some(details),
            },
            other => other,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            HandlerError::Coded { code, .. } => *code,
            HandlerError::Other(_) => ErrorCode::UnknownError,
        }
    }

    pub fn details(&self) -> Option<&Value> {
        match self {
            HandlerError::Coded { details, .. } => details.as_ref(),
            HandlerError::Other(_) => None,
        }
    }
}

/// Successful output of one handler call
#[derive(Debug, Clone, Default)]
pub struct HandlerOutput {
    pub content: String,
    /// Clamped into [0, 1] by the runtime; defaults to 1.0 when absent
    pub confidence: Option<f64>,
    pub metadata: HashMap<String, Value>,
}

impl HandlerOutput {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Stream of content chunks produced by a native streaming handler
pub type ChunkStream<'a> = BoxStream<'a, std::result::Result<String, HandlerError>>;

/// Handler hooks driven by `AgentRuntime`
#[async_trait]
pub trait Handler: Send + Sync {
    /// One-time setup after construction (connections, warm-up)
    async fn initialize(&self, _config: &HandlerConfig) -> std::result::Result<(), HandlerError> {
        Ok(())
    }

    /// Run the handler once. Long-running work should observe `cancel`.
    async fn execute_once(
        &self,
        config: &HandlerConfig,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
    ) -> std::result::Result<HandlerOutput, HandlerError>;

    /// Native streaming path; `None` makes the runtime chunk `execute_once` output
    fn execute_streaming<'a>(
        &'a self,
        _config: &'a HandlerConfig,
        _ctx: &'a ExecutionContext,
        _cancel: CancellationToken,
    ) -> Option<ChunkStream<'a>> {
        None
    }

    /// Handler-specific configuration errors
    fn validate_specific_config(&self, _config: &HandlerConfig) -> Vec<String> {
        Vec::new()
    }

    fn capabilities(&self) -> Vec<String>;

    async fn perform_health_check(&self) -> bool {
        true
    }

    async fn perform_cleanup(&self) -> std::result::Result<(), HandlerError> {
        Ok(())
    }
}

/// Builds handler instances for one handler type
pub trait HandlerFactory: Send + Sync {
    fn create(&self, config: &HandlerConfig) -> Result<Box<dyn Handler>>;
}

impl<F> HandlerFactory for F
where
    F: Fn(&HandlerConfig) -> Result<Box<dyn Handler>> + Send + Sync,
{
    fn create(&self, config: &HandlerConfig) -> Result<Box<dyn Handler>> {
        self(config)
    }
}
