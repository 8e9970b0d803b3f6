// src/runtime/mod.rs
//! Handler execution runtime
//!
//! This module provides the shared framework every task handler runs on:
//!
//! - **Handler**: the contract a specialized handler implements
//! - **Agent Runtime**: validation, timeout, cancellation and error shaping
//!   around one handler instance, in one-shot and streaming form
//! - **Agent Pool**: per-type LRU + TTL pools of reusable instances
//! - **Task Processor**: bounded-concurrency fan-out with retry and caching
//! - **Registry / Dispatcher**: route a request to a pooled instance
//!
//! # Architecture
//!
//! ```text
//!            Dispatcher
//!                │
//!     ┌──────────┴──────────┐
//!     │                     │
//! HandlerRegistry       AgentPool
//! (type → factory)   (type → LRU<key, instance>)
//!                           │
//!                     AgentRuntime ── TelemetryRecorder
//!                           │
//!                     dyn Handler ── TaskProcessor (fan-out)
//! ```

pub mod agent_pool;
pub mod agent_runtime;
pub mod dispatcher;
pub mod handler;
pub mod registry;
pub mod task_processor;
pub mod ttl_cache;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use agent_pool::{AgentPool, AgentPoolConfig, PoolKey, PoolKeyScope, PoolStats};
pub use agent_runtime::{AgentRuntime, AgentRuntimeConfig};
pub use dispatcher::Dispatcher;
pub use handler::{Handler, HandlerError, HandlerFactory, HandlerOutput};
pub use registry::HandlerRegistry;
pub use task_processor::{
    BatchReport, ProcessorConfig, RetryPolicy, TaskError, TaskErrorKind, TaskProcessor,
};
pub use types::{
    Environment, ErrorCode, ExecutionContext, ExecutionResult, HandlerConfig, HandlerType,
};
