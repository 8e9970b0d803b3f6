// src/observability/mod.rs
//! Logging, metrics and execution telemetry
//!
//! - **Tracing**: `tracing-subscriber` with env-filter, JSON or text output
//! - **Metrics**: `metrics` facade exported by a Prometheus listener
//! - **Telemetry**: non-blocking execution event queue with a background
//!   writer feeding a pluggable sink

pub mod telemetry;

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub use telemetry::{ExecutionEvent, LogSink, Outcome, TelemetryRecorder, TelemetrySink};

/// Log output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Prometheus exporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1:9464".to_string(),
        }
    }
}

/// Install the global tracing subscriber
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| EngineError::ObservabilityError(format!("Invalid log filter: {}", e)))?;

    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
    };

    result.map_err(|e| EngineError::ObservabilityError(format!("Tracing init failed: {}", e)))
}

/// Install the Prometheus metrics recorder, if enabled
pub fn init_metrics(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    let addr: SocketAddr = config.listen_addr.parse().map_err(|e| {
        EngineError::ObservabilityError(format!(
            "Invalid metrics address '{}': {}",
            config.listen_addr, e
        ))
    })?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| EngineError::ObservabilityError(format!("Metrics init failed: {}", e)))?;

    info!("Prometheus metrics listening on {}", addr);
    Ok(())
}
