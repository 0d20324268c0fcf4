//! Tool-augmented research agent
//!
//! The model is offered web search and may call it any number of times,
//! up to `max_iterations` turns. Search failures are reported back to the
//! model as tool output instead of aborting the step.

use crate::context::models::{Message, ToolCall};
use crate::llm::{ChatModel, ChatRequest, LlmError, ModelTurn};
use crate::search::{SearchTool, WEB_SEARCH_TOOL};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Agent errors
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Model error: {0}")]
    Model(#[from] LlmError),

    #[error("Model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Model returned an empty answer")]
    EmptyAnswer,
}

/// Final answer of an agent run
#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutcome {
    pub markdown: String,
    pub searches: usize,
}

pub struct ResearchAgent {
    model: Arc<dyn ChatModel>,
    search: Arc<dyn SearchTool>,
    max_iterations: usize,
    call_timeout: Duration,
}

impl ResearchAgent {
    pub fn new(
        model: Arc<dyn ChatModel>,
        search: Arc<dyn SearchTool>,
        max_iterations: usize,
        call_timeout: Duration,
    ) -> Self {
        Self {
            model,
            search,
            max_iterations,
            call_timeout,
        }
    }

    /// Run until the model answers without calling a tool
    pub async fn run(&self, mut messages: Vec<Message>) -> Result<AgentOutcome, AgentError> {
        let tools = vec![self.search.spec()];
        let mut searches = 0;

        for iteration in 0..self.max_iterations {
            let request = ChatRequest::new("research", messages.clone()).with_tools(tools.clone());
            let reply = self.invoke(request).await?;

            match ModelTurn::from_message(reply.clone()) {
                ModelTurn::DirectAnswer(content) => {
                    return finish(content, searches);
                }
                ModelTurn::Invocation { calls, .. } => {
                    debug!(
                        "Agent iteration {}: {} tool call(s)",
                        iteration + 1,
                        calls.len()
                    );
                    messages.push(reply);
                    for call in &calls {
                        if call.name == WEB_SEARCH_TOOL {
                            searches += 1;
                        }
                        messages.push(self.execute(call).await);
                    }
                }
            }
        }

        warn!(
            "Agent hit {} iterations without a final answer, forcing one",
            self.max_iterations
        );
        messages.push(Message::user(
            "Stop searching now and write your findings for this step based on the results above.",
        ));
        let reply = self.invoke(ChatRequest::new("research", messages)).await?;
        finish(reply.content, searches)
    }

    async fn invoke(&self, request: ChatRequest) -> Result<Message, AgentError> {
        tokio::time::timeout(self.call_timeout, self.model.invoke(request))
            .await
            .map_err(|_| AgentError::Timeout(self.call_timeout))?
            .map_err(AgentError::from)
    }

    /// Run one tool call and wrap its output as a tool message
    async fn execute(&self, call: &ToolCall) -> Message {
        if call.name != WEB_SEARCH_TOOL {
            warn!("Model requested unknown tool {}", call.name);
            return Message::tool(&call.id, format!("Error: unknown tool {}", call.name));
        }

        let Some(query) = call.arg_str("query").filter(|q| !q.trim().is_empty()) else {
            return Message::tool(&call.id, "Error: missing required argument `query`");
        };

        let outcome = tokio::time::timeout(self.call_timeout, self.search.search(query)).await;
        let content = match outcome {
            Ok(Ok(results)) => {
                debug!("Search {:?} returned {} results", query, results.len());
                serde_json::to_string(&results).unwrap_or_else(|_| "[]".to_string())
            }
            Ok(Err(e)) => {
                warn!("Search {:?} failed: {}", query, e);
                format!("Error: search failed: {}", e)
            }
            Err(_) => {
                warn!("Search {:?} timed out", query);
                format!("Error: search timed out after {:?}", self.call_timeout)
            }
        };

        Message::tool(&call.id, content)
    }
}

fn finish(content: String, searches: usize) -> Result<AgentOutcome, AgentError> {
    if content.trim().is_empty() {
        return Err(AgentError::EmptyAnswer);
    }
    Ok(AgentOutcome {
        markdown: content,
        searches,
    })
}
