// src/runtime/types.rs
//! Data model shared by the runtime, the pool and every handler
//!
//! - `HandlerConfig`: immutable identity and tuning of one handler instance
//! - `ExecutionContext`: per-call input
//! - `ExecutionResult`: per-call output, produced exactly once

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Default execution timeout (5 minutes)
pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;

/// Kinds of task handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerType {
    WebSearch,
    CodeExecution,
    UrlRetrieval,
    Translation,
    ThirdPartyApi,
    Completion,
}

impl HandlerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerType::WebSearch => "web_search",
            HandlerType::CodeExecution => "code_execution",
            HandlerType::UrlRetrieval => "url_retrieval",
            HandlerType::Translation => "translation",
            HandlerType::ThirdPartyApi => "third_party_api",
            HandlerType::Completion => "completion",
        }
    }
}

impl fmt::Display for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a handler's work runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    HostedModel,
    LocalSandbox,
    ThirdPartyApi,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::HostedModel => "hosted_model",
            Environment::LocalSandbox => "local_sandbox",
            Environment::ThirdPartyApi => "third_party_api",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity and tuning for one handler instance
///
/// Built once by the caller and never mutated afterwards; the owning
/// `AgentRuntime` keeps the only copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerConfig {
    pub id: String,
    pub name: String,
    pub handler_type: HandlerType,
    pub environment: Environment,
    pub model_id: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl HandlerConfig {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        handler_type: HandlerType,
        environment: Environment,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            handler_type,
            environment,
            model_id: model_id.into(),
            instructions: String::new(),
            tools: Vec::new(),
            temperature: None,
            max_tokens: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            parameters: HashMap::new(),
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

/// Conversation role of a history message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of conversation history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// Per-call input
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub query: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub user: String,
    pub model: String,
    pub locale: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub context: HashMap<String, Value>,
}

impl ExecutionContext {
    pub fn new(
        query: impl Into<String>,
        user: impl Into<String>,
        model: impl Into<String>,
        locale: impl Into<String>,
    ) -> Self {
        Self {
            query: query.into(),
            user: user.into(),
            model: model.into(),
            locale: locale.into(),
            ..Default::default()
        }
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Collect every missing required field
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let required = [
            ("query", &self.query),
            ("user", &self.user),
            ("model", &self.model),
            ("locale", &self.locale),
        ];

        let errors: Vec<String> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(field, _)| format!("{} is required", field))
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Error codes reported in `ExecutionResult::error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    CreationError,
    ExecutionError,
    TimeoutError,
    PoolError,
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::CreationError => "CREATION_ERROR",
            ErrorCode::ExecutionError => "EXECUTION_ERROR",
            ErrorCode::TimeoutError => "TIMEOUT_ERROR",
            ErrorCode::PoolError => "POOL_ERROR",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub processing_time_ms: u64,
    /// Always within [0, 1]
    pub confidence: f64,
    #[serde(default)]
    pub agent_metadata: HashMap<String, Value>,
}

/// Per-call output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub content: String,
    pub agent_id: String,
    pub agent_type: HandlerType,
    pub success: bool,
    pub correlation_id: String,
    pub metadata: ResultMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
}

impl ExecutionResult {
    pub fn failure(
        config: &HandlerConfig,
        correlation_id: String,
        code: ErrorCode,
        message: impl Into<String>,
        details: Option<Value>,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            content: String::new(),
            agent_id: config.id.clone(),
            agent_type: config.handler_type,
            success: false,
            correlation_id,
            metadata: ResultMetadata {
                processing_time_ms,
                confidence: 0.0,
                agent_metadata: HashMap::new(),
            },
            error: Some(ExecutionError {
                code,
                message: message.into(),
                details,
            }),
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}
