// src/handlers/mod.rs
//! Built-in task handlers
//!
//! - **completion**: generic model completion over an OpenAI-compatible API
//! - **url_retrieval**: parallel fetch of every URL mentioned in a query

pub mod completion;
pub mod url_retrieval;

use crate::runtime::registry::HandlerRegistry;
use crate::runtime::types::HandlerType;
use crate::utils::config::EngineConfig;
use crate::utils::errors::Result;
use std::sync::Arc;
use std::time::Duration;

pub use completion::{ChatCompletionsBackend, ChatCompletionsConfig, CompletionBackend, CompletionHandler};
pub use url_retrieval::{Fetcher, HttpFetcher, UrlRetrievalHandler};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const FETCH_MAX_CHARS: usize = 20_000;

/// Registry with every built-in handler wired to its default backend
pub fn builtin_registry(config: &EngineConfig) -> Result<HandlerRegistry> {
    let backend: Arc<dyn CompletionBackend> = Arc::new(ChatCompletionsBackend::new(&config.completion)?);
    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(FETCH_TIMEOUT, FETCH_MAX_CHARS)?);

    let mut registry = HandlerRegistry::new();
    registry
        .register(HandlerType::Completion, CompletionHandler::factory(backend))
        .register(
            HandlerType::UrlRetrieval,
            UrlRetrievalHandler::factory(fetcher, config.processor.clone()),
        );

    Ok(registry)
}
