//! Model-backed summarization of dialogue blocks

use crate::context::models::Message;
use crate::llm::{ChatModel, ChatRequest, LlmError};
use crate::prompts::{PromptError, PromptRenderer, COMPRESS};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Summarizer trait for different summarization strategies
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize a block rendered as `"<role>: <content>"` lines
    async fn summarize_dialogue(&self, dialogue: &str) -> Result<String, SummarizerError>;
}

/// Summarizer that sends the `compress` prompt to a chat model
pub struct LlmSummarizer {
    model: Arc<dyn ChatModel>,
    prompts: Arc<dyn PromptRenderer>,
    timeout: Duration,
}

impl LlmSummarizer {
    pub fn new(model: Arc<dyn ChatModel>, prompts: Arc<dyn PromptRenderer>, timeout: Duration) -> Self {
        Self {
            model,
            prompts,
            timeout,
        }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize_dialogue(&self, dialogue: &str) -> Result<String, SummarizerError> {
        let prompt = self
            .prompts
            .render(COMPRESS, &serde_json::json!({ "dialogue": dialogue }))?;

        debug!("Summarizing dialogue block ({} chars)", dialogue.chars().count());

        let request = ChatRequest::new("compress", vec![Message::user(prompt)]);
        let response = tokio::time::timeout(self.timeout, self.model.invoke(request))
            .await
            .map_err(|_| SummarizerError::Timeout(self.timeout))??;

        let summary = response.content.trim().to_string();
        if summary.is_empty() {
            return Err(SummarizerError::Empty);
        }
        Ok(summary)
    }
}

/// Summarizer errors
#[derive(Debug, thiserror::Error)]
pub enum SummarizerError {
    #[error("Prompt error: {0}")]
    Prompt(#[from] PromptError),

    #[error("Model error: {0}")]
    Model(#[from] LlmError),

    #[error("Summarization timed out after {0:?}")]
    Timeout(Duration),

    #[error("Model returned an empty summary")]
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::OutputSchema;
    use crate::prompts::TemplateRegistry;

    struct FixedModel(&'static str);

    #[async_trait]
    impl ChatModel for FixedModel {
        async fn invoke(&self, request: ChatRequest) -> Result<Message, LlmError> {
            assert_eq!(request.operation, "compress");
            assert!(request.messages[0].content.contains("user: hello"));
            Ok(Message::assistant(self.0))
        }

        async fn invoke_json(
            &self,
            _request: ChatRequest,
            _schema: &OutputSchema,
        ) -> Result<serde_json::Value, LlmError> {
            Err(LlmError::Decode("unused".to_string()))
        }
    }

    struct SlowModel;

    #[async_trait]
    impl ChatModel for SlowModel {
        async fn invoke(&self, _request: ChatRequest) -> Result<Message, LlmError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Message::assistant("late"))
        }

        async fn invoke_json(
            &self,
            _request: ChatRequest,
            _schema: &OutputSchema,
        ) -> Result<serde_json::Value, LlmError> {
            Err(LlmError::Decode("unused".to_string()))
        }
    }

    fn prompts() -> Arc<dyn PromptRenderer> {
        Arc::new(TemplateRegistry::new().unwrap())
    }

    #[tokio::test]
    async fn test_summarize_dialogue() {
        let summarizer = LlmSummarizer::new(Arc::new(FixedModel(" short summary ")), prompts(), Duration::from_secs(5));
        let summary = summarizer
            .summarize_dialogue("user: hello\nassistant: hi there\n")
            .await
            .unwrap();
        assert_eq!(summary, "short summary");
    }

    #[tokio::test]
    async fn test_empty_summary_is_error() {
        let summarizer = LlmSummarizer::new(Arc::new(FixedModel("   ")), prompts(), Duration::from_secs(5));
        let result = summarizer.summarize_dialogue("user: hello\n").await;
        assert!(matches!(result, Err(SummarizerError::Empty)));
    }

    #[tokio::test]
    async fn test_timeout() {
        let summarizer = LlmSummarizer::new(Arc::new(SlowModel), prompts(), Duration::from_millis(20));
        let result = summarizer.summarize_dialogue("user: hello\n").await;
        assert!(matches!(result, Err(SummarizerError::Timeout(_))));
    }
}
