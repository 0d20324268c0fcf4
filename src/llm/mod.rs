//! Chat model boundary
//!
//! The research pipeline only talks to models through [`ChatModel`]:
//! plain invocation (optionally with bound tools), streaming, and
//! schema-constrained JSON output.

pub mod openai;

pub use openai::OpenAiClient;

use crate::context::models::{Message, ToolCall};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Stream of content deltas
pub type DeltaStream = BoxStream<'static, Result<String, LlmError>>;

/// Model invocation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("Model client not configured: {0}")]
    NotConfigured(String),

    #[error("Circuit breaker is open: {0}")]
    CircuitOpen(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Structured output did not match schema: {0}")]
    Decode(String),
}

/// A callable capability offered to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object
    pub parameters: serde_json::Value,
}

/// JSON schema the model output must follow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSchema {
    pub name: String,
    pub schema: serde_json::Value,
}

/// One model call
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Label used for metrics, breaker keys and logs (e.g. "coordinate")
    pub operation: &'static str,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
}

impl ChatRequest {
    pub fn new(operation: &'static str, messages: Vec<Message>) -> Self {
        Self {
            operation,
            messages,
            tools: Vec::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }
}

/// What the model did with a tool-bound turn
#[derive(Debug, Clone, PartialEq)]
pub enum ModelTurn {
    /// Plain answer, no capability invoked
    DirectAnswer(String),
    /// One or more capability invocations, with any accompanying text
    Invocation { content: String, calls: Vec<ToolCall> },
}

impl ModelTurn {
    pub fn from_message(message: Message) -> Self {
        if message.metadata.tool_calls.is_empty() {
            ModelTurn::DirectAnswer(message.content)
        } else {
            ModelTurn::Invocation {
                content: message.content,
                calls: message.metadata.tool_calls,
            }
        }
    }
}

/// Chat model capability
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Single completion; tool invocations are returned in the message metadata
    async fn invoke(&self, request: ChatRequest) -> Result<Message, LlmError>;

    /// Completion as a stream of content deltas
    async fn stream(&self, request: ChatRequest) -> Result<DeltaStream, LlmError> {
        let message = self.invoke(request).await?;
        Ok(stream::once(async move { Ok(message.content) }).boxed())
    }

    /// Completion constrained to a JSON schema, returned as a JSON value
    async fn invoke_json(
        &self,
        request: ChatRequest,
        schema: &OutputSchema,
    ) -> Result<serde_json::Value, LlmError>;
}

/// Decode a schema-constrained completion into `T`
pub async fn invoke_structured<T: DeserializeOwned>(
    model: &dyn ChatModel,
    request: ChatRequest,
    schema: &OutputSchema,
) -> Result<T, LlmError> {
    let value = model.invoke_json(request, schema).await?;
    serde_json::from_value(value).map_err(|e| LlmError::Decode(e.to_string()))
}

/// Drain a delta stream into one string
pub async fn collect_stream(mut deltas: DeltaStream) -> Result<String, LlmError> {
    let mut out = String::new();
    while let Some(delta) = deltas.next().await {
        out.push_str(&delta?);
    }
    Ok(out)
}

/// Parse model text as JSON, tolerating a surrounding Markdown code fence
pub fn parse_json_content(content: &str) -> Result<serde_json::Value, LlmError> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed);

    serde_json::from_str(body.trim()).map_err(|e| LlmError::Decode(e.to_string()))
}
