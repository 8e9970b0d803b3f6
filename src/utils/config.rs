// src/utils/config.rs
//! Engine configuration
//!
//! Layered loading with the `config` crate:
//!
//! 1. Built-in defaults
//! 2. Optional file (`DISPATCH_CONFIG`, else `dispatch.{yaml,toml,json}`)
//! 3. Environment overrides, e.g. `DISPATCH__POOL__MAX_SIZE=20`

use crate::handlers::completion::ChatCompletionsConfig;
use crate::observability::{LoggingConfig, MetricsConfig};
use crate::observability::telemetry::TelemetryConfig;
use crate::runtime::agent_pool::AgentPoolConfig;
use crate::runtime::agent_runtime::AgentRuntimeConfig;
use crate::runtime::task_processor::ProcessorConfig;
use crate::utils::errors::{EngineError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

const CONFIG_PATH_ENV: &str = "DISPATCH_CONFIG";
const DEFAULT_CONFIG_STEM: &str = "dispatch";
const ENV_PREFIX: &str = "DISPATCH";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub runtime: AgentRuntimeConfig,
    pub pool: AgentPoolConfig,
    pub processor: ProcessorConfig,
    pub telemetry: TelemetryConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    pub completion: ChatCompletionsConfig,
}

impl EngineConfig {
    /// Load configuration from defaults, optional file and environment
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).ok();
        Self::load_from(path.as_deref().map(Path::new))
    }

    /// Load configuration, reading `path` instead of the default file lookup
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let defaults = Config::try_from(&EngineConfig::default())?;

        let mut builder = Config::builder().add_source(defaults);

        builder = match path {
            Some(path) => {
                debug!("Loading configuration file {:?}", path);
                builder.add_source(File::from(path).required(true))
            }
            None => builder.add_source(File::with_name(DEFAULT_CONFIG_STEM).required(false)),
        };

        let config: EngineConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot operate with
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.pool.max_size == 0 {
            errors.push("pool.max_size must be at least 1".to_string());
        }
        if self.pool.sweep_interval_secs == 0 {
            errors.push("pool.sweep_interval_secs must be at least 1".to_string());
        }
        if self.processor.concurrency_limit == 0 {
            errors.push("processor.concurrency_limit must be at least 1".to_string());
        }
        if self.processor.retry.base_delay_ms > self.processor.retry.max_delay_ms {
            errors.push("processor.retry.base_delay_ms cannot exceed max_delay_ms".to_string());
        }
        if self.runtime.stream_chunk_size == 0 {
            errors.push("runtime.stream_chunk_size must be at least 1".to_string());
        }
        if self.telemetry.queue_capacity == 0 {
            errors.push("telemetry.queue_capacity must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::ConfigError(errors.join("; ")))
        }
    }

    /// Render the effective configuration as YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| EngineError::ConfigError(e.to_string()))
    }
}
