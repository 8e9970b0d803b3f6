// src/utils/errors.rs
//! Engine error types
//!
//! `EngineError` covers the failures that surface directly to a caller:
//! configuration problems, handler construction and pool bookkeeping.
//! Execution failures never use this type past the runtime boundary; they
//! are reported as data inside `ExecutionResult`.

use crate::runtime::types::{ErrorCode, HandlerType};
use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Handler configuration failed validation
    #[error("Invalid handler configuration: {}", .0.join("; "))]
    InvalidHandlerConfig(Vec<String>),

    /// Engine configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Handler construction or initialization failed
    #[error("Failed to create {handler_type} handler: {reason}")]
    CreationFailed {
        handler_type: HandlerType,
        reason: String,
    },

    /// No factory registered for a handler type
    #[error("No handler registered for type {0}")]
    UnknownHandler(HandlerType),

    /// Pool bookkeeping failure
    #[error("Pool error: {0}")]
    PoolError(String),

    /// Handler cleanup failed
    #[error("Cleanup failed: {0}")]
    CleanupFailed(String),

    /// Observability setup failed
    #[error("Observability error: {0}")]
    ObservabilityError(String),
}

impl EngineError {
    /// Error code reported for this failure
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::InvalidHandlerConfig(_) | EngineError::ConfigError(_) => {
                ErrorCode::ValidationError
            }
            EngineError::CreationFailed { .. } | EngineError::UnknownHandler(_) => {
                ErrorCode::CreationError
            }
            EngineError::PoolError(_) | EngineError::CleanupFailed(_) => ErrorCode::PoolError,
            EngineError::ObservabilityError(_) => ErrorCode::UnknownError,
        }
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(e: config::ConfigError) -> Self {
        EngineError::ConfigError(e.to_string())
    }
}
