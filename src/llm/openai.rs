//! OpenAI-compatible chat completions client with retry and circuit breaker

use super::{ChatModel, ChatRequest, DeltaStream, LlmError, OutputSchema, ToolSpec};
use crate::breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::config::LlmConfig;
use crate::context::models::{Message, ToolCall};
use crate::metrics::METRICS;
use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Chat model client for any OpenAI-compatible endpoint
pub struct OpenAiClient {
    http: Client,
    endpoint: String,
    model: String,
    api_key: Option<Secret<String>>,
    temperature: f32,
    max_retries: usize,
    retry_backoff: Duration,
    breaker: Arc<CircuitBreaker>,
}

impl OpenAiClient {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        if config.base_url.trim().is_empty() {
            return Err(LlmError::NotConfigured("llm.base_url is empty".to_string()));
        }

        let http = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        let api_key = config.resolve_api_key();
        if api_key.is_none() {
            warn!(
                "No API key found in config or ${}; requests are sent unauthenticated",
                config.api_key_env
            );
        }

        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: config.breaker_failures,
            reset_timeout: config.breaker_reset_timeout(),
        }));

        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff(),
            breaker,
        })
    }

    fn build_body(&self, request: &ChatRequest) -> CompletionRequest {
        CompletionRequest {
            model: self.model.clone(),
            messages: request.messages.iter().map(WireMessage::from).collect(),
            tools: request.tools.iter().map(WireTool::from).collect(),
            temperature: self.temperature,
            response_format: None,
            stream: false,
        }
    }

    /// Send with retry, returning the first successful response
    async fn send(
        &self,
        operation: &'static str,
        body: &CompletionRequest,
    ) -> Result<reqwest::Response, LlmError> {
        if self.breaker.is_open(operation) {
            METRICS.llm_circuit_open.with_label_values(&[operation]).inc();
            error!("Circuit breaker is open for {} operation", operation);
            return Err(LlmError::CircuitOpen(operation.to_string()));
        }

        let mut attempt = 0;
        loop {
            attempt += 1;

            match self.send_once(body).await {
                Ok(response) => {
                    self.breaker.mark_success(operation);
                    return Ok(response);
                }
                Err((err, retryable)) => {
                    self.breaker.mark_failure(operation);

                    if !retryable || attempt > self.max_retries {
                        error!("{} request failed after {} attempts: {}", operation, attempt, err);
                        return Err(err);
                    }

                    let backoff = self.calculate_backoff(attempt);
                    warn!(
                        "{} attempt {} failed: {}, retrying in {:?}",
                        operation, attempt, err, backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn send_once(
        &self,
        body: &CompletionRequest,
    ) -> Result<reqwest::Response, (LlmError, bool)> {
        let mut req = self.http.post(&self.endpoint).json(body);
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key.expose_secret());
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                (LlmError::Timeout(e.to_string()), true)
            } else {
                (LlmError::RequestFailed(e.to_string()), true)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            let retryable = status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
            return Err((
                LlmError::Upstream(format!("Status {}: {}", status, error_text)),
                retryable,
            ));
        }

        Ok(response)
    }

    /// Exponential backoff with up to 50% jitter
    fn calculate_backoff(&self, attempt: usize) -> Duration {
        let base = self.retry_backoff.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(10));
        let jitter = if base > 0 {
            rand::thread_rng().gen_range(0..=base / 2)
        } else {
            0
        };
        Duration::from_millis(exp + jitter)
    }

    async fn complete(
        &self,
        operation: &'static str,
        body: CompletionRequest,
    ) -> Result<Message, LlmError> {
        let start = Instant::now();
        let result = self.complete_inner(operation, &body).await;
        METRICS.record_llm_request(operation, result.is_ok(), start.elapsed().as_secs_f64());
        result
    }

    async fn complete_inner(
        &self,
        operation: &'static str,
        body: &CompletionRequest,
    ) -> Result<Message, LlmError> {
        debug!(
            "Calling chat completions: operation={}, messages={}, tools={}",
            operation,
            body.messages.len(),
            body.tools.len()
        );

        let response = self.send(operation, body).await?;
        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("No choices in response".to_string()))?;

        Ok(choice.message.into_message())
    }
}

#[async_trait]
impl ChatModel for OpenAiClient {
    async fn invoke(&self, request: ChatRequest) -> Result<Message, LlmError> {
        let body = self.build_body(&request);
        self.complete(request.operation, body).await
    }

    async fn stream(&self, request: ChatRequest) -> Result<DeltaStream, LlmError> {
        let start = Instant::now();
        let mut body = self.build_body(&request);
        body.stream = true;

        let response = self.send(request.operation, &body).await;
        METRICS.record_llm_request(
            request.operation,
            response.is_ok(),
            start.elapsed().as_secs_f64(),
        );

        Ok(sse_deltas(response?))
    }

    async fn invoke_json(
        &self,
        request: ChatRequest,
        schema: &OutputSchema,
    ) -> Result<Value, LlmError> {
        let mut body = self.build_body(&request);
        body.response_format = Some(serde_json::json!({
            "type": "json_schema",
            "json_schema": {
                "name": schema.name,
                "schema": schema.schema,
            }
        }));

        let message = self.complete(request.operation, body).await?;
        super::parse_json_content(&message.content)
    }
}

/// Turn an SSE response body into content deltas, ending at `[DONE]`
fn sse_deltas(response: reqwest::Response) -> DeltaStream {
    let mut bytes = response.bytes_stream();

    let deltas = async_stream::try_stream! {
        let mut buffer: Vec<u8> = Vec::new();
        let mut done = false;

        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| LlmError::RequestFailed(e.to_string()))?;
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                match parse_sse_line(line.trim())? {
                    SseLine::Delta(text) => yield text,
                    SseLine::Done => {
                        done = true;
                        break;
                    }
                    SseLine::Skip => {}
                }
            }

            if done {
                break;
            }
        }
    };

    deltas.boxed()
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Delta(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseLine, LlmError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim();

    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }

    let chunk: StreamChunk =
        serde_json::from_str(data).map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

    let text: String = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .collect();

    if text.is_empty() {
        Ok(SseLine::Skip)
    } else {
        Ok(SseLine::Delta(text))
    }
}

// OpenAI-compatible API types
#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role.as_str().to_string(),
            content: Some(message.content.clone()),
            name: message.name.clone(),
            tool_call_id: message.tool_call_id.clone(),
            tool_calls: message
                .tool_calls()
                .iter()
                .map(|call| WireToolCall {
                    id: call.id.clone(),
                    kind: "function".to_string(),
                    function: WireFunction {
                        name: call.name.clone(),
                        arguments: call.args.to_string(),
                    },
                })
                .collect(),
        }
    }
}

impl WireMessage {
    fn into_message(self) -> Message {
        let calls = self
            .tool_calls
            .into_iter()
            .map(|call| {
                let args = serde_json::from_str(&call.function.arguments).unwrap_or_else(|e| {
                    warn!(
                        "Tool call {} arguments are not valid JSON: {}",
                        call.function.name, e
                    );
                    Value::Object(Default::default())
                });
                ToolCall::new(call.id, call.function.name, args)
            })
            .collect();

        Message::assistant(self.content.unwrap_or_default()).with_tool_calls(calls)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: WireFunction,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: ToolSpec,
}

impl From<&ToolSpec> for WireTool {
    fn from(spec: &ToolSpec) -> Self {
        Self {
            kind: "function",
            function: spec.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}
