// src/handlers/completion.rs
//! Generic model completion handler
//!
//! The handler assembles the conversation (instructions, history, query)
//! and hands it to a [`CompletionBackend`]. [`ChatCompletionsBackend`]
//! talks to any OpenAI-compatible `/v1/chat/completions` endpoint.

use crate::runtime::handler::{Handler, HandlerError, HandlerFactory, HandlerOutput};
use crate::runtime::types::{ExecutionContext, HandlerConfig, Message, Role};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Connection settings for [`ChatCompletionsBackend`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatCompletionsConfig {
    pub base_url: String,

    /// Environment variable holding the bearer token, if any
    pub api_key_env: String,

    pub request_timeout_secs: u64,
}

impl Default for ChatCompletionsConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            request_timeout_secs: 120,
        }
    }
}

/// Backend-neutral completion request
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub content: String,
    pub finish_reason: Option<String>,
    pub total_tokens: Option<u64>,
}

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<Completion, HandlerError>;

    async fn health_check(&self) -> bool {
        true
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    total_tokens: u64,
}

impl ChatResponse {
    fn into_completion(self) -> std::result::Result<Completion, HandlerError> {
        let total_tokens = self.usage.map(|u| u.total_tokens);
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| HandlerError::execution("Completion response contained no choices"))?;

        Ok(Completion {
            content: choice.message.content.unwrap_or_default(),
            finish_reason: choice.finish_reason,
            total_tokens,
        })
    }
}

/// reqwest client for OpenAI-compatible chat completion endpoints
pub struct ChatCompletionsBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl ChatCompletionsBackend {
    pub fn new(config: &ChatCompletionsConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| EngineError::ConfigError(format!("HTTP client: {}", e)))?;

        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.is_empty());

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }
}

#[async_trait]
impl CompletionBackend for ChatCompletionsBackend {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<Completion, HandlerError> {
        let body = ChatRequest {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: false,
        };

        let mut req = self.http.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| HandlerError::execution(format!("Completion request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "<unavailable>".to_string());
            return Err(HandlerError::execution(format!(
                "Completion request failed with status {}: {}",
                status, text
            ))
            .with_details(json!({ "status": status.as_u16() })));
        }

        response
            .json::<ChatResponse>()
            .await
            .map_err(|e| HandlerError::execution(format!("Invalid completion payload: {}", e)))?
            .into_completion()
    }
}

/// Handler for [`HandlerType::Completion`](crate::runtime::types::HandlerType::Completion)
pub struct CompletionHandler {
    backend: Arc<dyn CompletionBackend>,
}

impl CompletionHandler {
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self { backend }
    }

    /// Factory sharing one backend across every created handler
    pub fn factory(backend: Arc<dyn CompletionBackend>) -> impl HandlerFactory {
        move |_config: &HandlerConfig| -> Result<Box<dyn Handler>> {
            Ok(Box::new(CompletionHandler::new(Arc::clone(&backend))))
        }
    }

    fn build_request(config: &HandlerConfig, ctx: &ExecutionContext) -> CompletionRequest {
        let mut messages = Vec::with_capacity(ctx.messages.len() + 2);

        if !config.instructions.trim().is_empty() {
            messages.push(Message {
                role: Role::System,
                content: config.instructions.clone(),
            });
        }
        messages.extend(ctx.messages.iter().cloned());
        messages.push(Message {
            role: Role::User,
            content: ctx.query.clone(),
        });

        CompletionRequest {
            model: config.model_id.clone(),
            messages,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

#[async_trait]
impl Handler for CompletionHandler {
    async fn execute_once(
        &self,
        config: &HandlerConfig,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
    ) -> std::result::Result<HandlerOutput, HandlerError> {
        let request = Self::build_request(config, ctx);
        debug!(
            "Requesting completion from {} with {} messages",
            request.model,
            request.messages.len()
        );

        let completion = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(HandlerError::execution("Completion cancelled"));
            }
            result = self.backend.complete(&request) => result?,
        };

        let mut output = HandlerOutput::new(completion.content);
        if let Some(reason) = completion.finish_reason {
            output = output.with_metadata("finish_reason", json!(reason));
        }
        if let Some(tokens) = completion.total_tokens {
            output = output.with_metadata("total_tokens", json!(tokens));
        }
        Ok(output)
    }

    fn validate_specific_config(&self, config: &HandlerConfig) -> Vec<String> {
        let mut errors = Vec::new();

        if let Some(t) = config.temperature {
            if !(0.0..=2.0).contains(&t) {
                errors.push(format!("temperature must be within [0, 2], got {}", t));
            }
        }
        if config.max_tokens == Some(0) {
            errors.push("max_tokens must be greater than 0".to_string());
        }

        errors
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["completion".to_string(), "conversation".to_string()]
    }

    async fn perform_health_check(&self) -> bool {
        self.backend.health_check().await
    }
}
