// src/utils/mod.rs
//! Common utilities: configuration, errors and identifiers

pub mod config;
pub mod errors;
pub mod ids;

pub use config::EngineConfig;
pub use errors::{EngineError, Result};
