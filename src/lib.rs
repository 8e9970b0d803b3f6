// src/lib.rs
//! Dispatch Engine Library
//!
//! Shared runtime for specialized task handlers (web search, code
//! execution, URL retrieval, translation, third-party APIs, completion):
//! bounded, cancellable execution, pooled handler instances and a
//! bounded-concurrency fan-out helper.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **runtime**: handler contract, execution runtime, instance pool,
//!   task processor, registry and dispatcher
//! - **handlers**: built-in completion and URL retrieval handlers
//! - **observability**: tracing, metrics and execution telemetry
//! - **utils**: configuration, errors and identifiers

// Public module exports
pub mod handlers;
pub mod observability;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use runtime::agent_pool::{AgentPool, AgentPoolConfig};
pub use runtime::agent_runtime::{AgentRuntime, AgentRuntimeConfig};
pub use runtime::dispatcher::Dispatcher;
pub use runtime::handler::{Handler, HandlerError, HandlerFactory, HandlerOutput};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
