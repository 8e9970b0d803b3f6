// src/handlers/url_retrieval.rs
//! URL retrieval handler
//!
//! Pulls every `http(s)://` URL out of the query (plus any listed under
//! `context["urls"]`), fetches them through the task processor and renders
//! one section per URL. The streaming path emits each section as soon as
//! it is ready, in URL order.

use crate::runtime::handler::{ChunkStream, Handler, HandlerError, HandlerFactory, HandlerOutput};
use crate::runtime::task_processor::{
    BatchReport, ProcessorConfig, TaskError, TaskErrorKind, TaskProcessor, TaskRecord,
};
use crate::runtime::types::{ExecutionContext, HandlerConfig};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default cap on URLs per request, overridden by `parameters.max_urls`
pub const DEFAULT_MAX_URLS: usize = 10;

const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', ')', ']', '}', '>', '"', '\''];

/// Retrieves the text behind one URL
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> std::result::Result<String, TaskError>;
}

/// reqwest-backed fetcher
pub struct HttpFetcher {
    http: reqwest::Client,
    max_chars: usize,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_chars: usize) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("dispatch-engine/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EngineError::ConfigError(format!("HTTP client: {}", e)))?;

        Ok(Self { http, max_chars })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> std::result::Result<String, TaskError> {
        let response = self.http.get(url).send().await.map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TaskError::categorized(
                Some(status.as_u16()),
                format!("HTTP {} for {}", status, url),
            ));
        }

        let body = response.text().await.map_err(|e| {
            TaskError::new(TaskErrorKind::ContentError, format!("Failed to read body: {}", e))
        })?;

        if body.trim().is_empty() {
            return Err(TaskError::new(TaskErrorKind::ContentError, "Empty content"));
        }

        Ok(body.chars().take(self.max_chars).collect())
    }
}

fn request_error(e: reqwest::Error) -> TaskError {
    if e.is_timeout() {
        TaskError::new(TaskErrorKind::Timeout, e.to_string())
    } else if e.is_builder() {
        TaskError::new(TaskErrorKind::InvalidInput, e.to_string())
    } else {
        TaskError::categorized(e.status().map(|s| s.as_u16()), e.to_string())
    }
}

/// Extract unique URLs in order of appearance, capped at `max_urls`
pub fn extract_urls(ctx: &ExecutionContext, max_urls: usize) -> Vec<String> {
    let from_query = ctx.query.split_whitespace().filter_map(|token| {
        let start = token.find("https://").or_else(|| token.find("http://"))?;
        let url = token[start..].trim_end_matches(TRAILING_PUNCTUATION);
        let scheme_len = if url.starts_with("https://") { 8 } else { 7 };
        (url.len() > scheme_len).then(|| url.to_string())
    });

    let from_context = ctx
        .context
        .get("urls")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .filter(|url| url.starts_with("http://") || url.starts_with("https://"))
        .map(str::to_string);

    let mut seen = HashSet::new();
    from_query
        .chain(from_context)
        .filter(|url| seen.insert(url.clone()))
        .take(max_urls)
        .collect()
}

fn render_record(record: &TaskRecord<String>) -> String {
    match &record.outcome {
        Ok(content) => format!("## {}\n\n{}\n\n", record.key, content.trim()),
        Err(e) => format!("## {}\n\nFailed ({}): {}\n\n", record.key, e.kind, e.message),
    }
}

/// Handler for [`HandlerType::UrlRetrieval`](crate::runtime::types::HandlerType::UrlRetrieval)
pub struct UrlRetrievalHandler {
    fetcher: Arc<dyn Fetcher>,
    processor: TaskProcessor<String>,
}

impl UrlRetrievalHandler {
    pub fn new(fetcher: Arc<dyn Fetcher>, processor_config: ProcessorConfig) -> Self {
        Self {
            fetcher,
            processor: TaskProcessor::new(processor_config),
        }
    }

    /// Factory sharing one fetcher; each handler owns its result cache
    pub fn factory(fetcher: Arc<dyn Fetcher>, processor_config: ProcessorConfig) -> impl HandlerFactory {
        move |_config: &HandlerConfig| -> Result<Box<dyn Handler>> {
            Ok(Box::new(UrlRetrievalHandler::new(
                Arc::clone(&fetcher),
                processor_config.clone(),
            )))
        }
    }

    fn max_urls(config: &HandlerConfig) -> usize {
        config
            .parameters
            .get("max_urls")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_URLS)
    }

    fn urls_for(
        config: &HandlerConfig,
        ctx: &ExecutionContext,
    ) -> std::result::Result<Vec<String>, HandlerError> {
        let urls = extract_urls(ctx, Self::max_urls(config));
        if urls.is_empty() {
            return Err(HandlerError::validation("No URLs found in query"));
        }
        Ok(urls)
    }

    async fn fetch_all(&self, urls: Vec<String>) -> BatchReport<String> {
        let fetcher = &self.fetcher;
        self.processor
            .process(urls, |url: &String| {
                let url = url.clone();
                async move { fetcher.fetch(&url).await }
            })
            .await
    }
}

#[async_trait]
impl Handler for UrlRetrievalHandler {
    async fn execute_once(
        &self,
        config: &HandlerConfig,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
    ) -> std::result::Result<HandlerOutput, HandlerError> {
        let urls = Self::urls_for(config, ctx)?;
        debug!("Retrieving {} URLs", urls.len());

        let report = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(HandlerError::execution("URL retrieval cancelled"));
            }
            report = self.fetch_all(urls) => report,
        };

        let stats = &report.stats;
        if stats.successful == 0 {
            let failures: Vec<Value> = report
                .records
                .iter()
                .filter_map(|r| {
                    r.outcome
                        .as_ref()
                        .err()
                        .map(|e| json!({ "url": r.key, "kind": e.kind, "message": e.message }))
                })
                .collect();
            return Err(
                HandlerError::execution(format!("All {} URLs failed", stats.total))
                    .with_details(json!({ "failures": failures })),
            );
        }

        let content: String = report.records.iter().map(render_record).collect();
        let confidence = stats.successful as f64 / stats.total as f64;

        Ok(HandlerOutput::new(content.trim_end())
            .with_confidence(confidence)
            .with_metadata("stats", json!(stats))
            .with_metadata("processing_method", json!(report.processing_method)))
    }

    fn execute_streaming<'a>(
        &'a self,
        config: &'a HandlerConfig,
        ctx: &'a ExecutionContext,
        cancel: CancellationToken,
    ) -> Option<ChunkStream<'a>> {
        let urls = match Self::urls_for(config, ctx) {
            Ok(urls) => urls,
            Err(e) => return Some(futures::stream::once(async move { Err(e) }).boxed()),
        };

        let fetcher = &self.fetcher;
        let limit = self.processor.config().concurrency_limit.max(1);
        let total = urls.len();

        // Failed sections are held back until some URL succeeds, so a batch
        // where every URL fails ends in a single error like `execute_once`
        let stream = futures::stream::iter(urls)
            .map(move |url| async move {
                let report = self
                    .processor
                    .process(vec![url], |url: &String| {
                        let url = url.clone();
                        async move { fetcher.fetch(&url).await }
                    })
                    .await;
                let section: String = report.records.iter().map(render_record).collect();
                (report.stats.successful > 0, section)
            })
            .buffered(limit)
            .scan(
                (0usize, false, Vec::new()),
                move |state, (ok, section)| {
                    let (seen, succeeded, held) = state;
                    *seen += 1;

                    let out: Vec<std::result::Result<String, HandlerError>> = if *succeeded {
                        vec![Ok(section)]
                    } else if ok {
                        *succeeded = true;
                        held.drain(..).chain(std::iter::once(section)).map(Ok).collect()
                    } else if *seen == total {
                        vec![Err(HandlerError::execution(format!("All {} URLs failed", total)))]
                    } else {
                        held.push(section);
                        Vec::new()
                    };

                    futures::future::ready(Some(futures::stream::iter(out)))
                },
            )
            .flatten()
            .take_until(async move { cancel.cancelled().await });

        Some(stream.boxed())
    }

    fn validate_specific_config(&self, config: &HandlerConfig) -> Vec<String> {
        match config.parameters.get("max_urls") {
            Some(v) if v.as_u64().map_or(true, |n| n == 0) => {
                vec!["parameters.max_urls must be a positive integer".to_string()]
            }
            _ => Vec::new(),
        }
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["url_retrieval".to_string(), "parallel_fetch".to_string()]
    }
}
